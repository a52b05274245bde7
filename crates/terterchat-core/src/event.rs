//! Push events delivered over the secure channel.
//!
//! Every non keep-alive frame is an envelope of the form
//! `<EVENT_NAME>|<json payload>`. The event name selects the payload schema;
//! the four group events share one schema and are told apart by name only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::FrameError;
use crate::protocol::ENVELOPE_SEPARATOR;

/// The fixed set of event names the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    NewMessage,
    EditMessage,
    DeleteMessage,
    MessageReceived,
    GroupMessageRead,
    AddUserToGroup,
    RemoveUserFromGroup,
    MadeAdmin,
    RemoveAdmin,
}

impl EventName {
    pub const ALL: [EventName; 9] = [
        EventName::NewMessage,
        EventName::EditMessage,
        EventName::DeleteMessage,
        EventName::MessageReceived,
        EventName::GroupMessageRead,
        EventName::AddUserToGroup,
        EventName::RemoveUserFromGroup,
        EventName::MadeAdmin,
        EventName::RemoveAdmin,
    ];

    /// Name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::NewMessage => "NEW_MESSAGE",
            EventName::EditMessage => "EDIT_MESSAGE",
            EventName::DeleteMessage => "DELETE_MESSAGE",
            EventName::MessageReceived => "MARK_MESSAGE_RECEIVED",
            EventName::GroupMessageRead => "GROUP_MESSAGE_READ",
            EventName::AddUserToGroup => "ADD_USER_TO_GROUP",
            EventName::RemoveUserFromGroup => "REMOVE_USER_FROM_GROUP",
            EventName::MadeAdmin => "MADE_ADMIN",
            EventName::RemoveAdmin => "REMOVE_ADMIN",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| FrameError::UnknownEvent(s.to_string()))
    }
}

/// Payload of `NEW_MESSAGE` and `EDIT_MESSAGE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    #[serde(default, deserialize_with = "nil_as_none")]
    pub group_id: Option<Uuid>,
    pub sender_id: Uuid,
    #[serde(default)]
    pub sender_username: Option<String>,
    pub description: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Payload of `DELETE_MESSAGE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    #[serde(default, deserialize_with = "nil_as_none")]
    pub group_id: Option<Uuid>,
}

/// Payload of `MARK_MESSAGE_RECEIVED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceived {
    pub id: Uuid,
    pub receiver_id: Uuid,
}

/// Payload of `GROUP_MESSAGE_READ`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessageRead {
    pub id: Uuid,
    pub group_id: Uuid,
    pub group_member_id: Uuid,
    pub group_member_username: String,
}

/// The member a group event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: Uuid,
    pub username: String,
    pub phonenumber: String,
}

/// Shared payload of the membership and admin events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEvent {
    /// Group display name.
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "nil_as_none")]
    pub group_id: Option<Uuid>,
    #[serde(rename = "group")]
    pub member: GroupMember,
    #[serde(rename = "emittedAt", default)]
    pub emitted_at: Option<String>,
}

/// Direction of a membership or admin change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Removed,
}

/// A decoded push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    NewMessage(MessagePayload),
    EditMessage(MessagePayload),
    DeleteMessage(DeletedMessage),
    MessageReceived(MessageReceived),
    GroupMessageRead(GroupMessageRead),
    GroupMembershipChanged(Change, GroupEvent),
    AdminChanged(Change, GroupEvent),
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::NewMessage(_) => EventName::NewMessage,
            Event::EditMessage(_) => EventName::EditMessage,
            Event::DeleteMessage(_) => EventName::DeleteMessage,
            Event::MessageReceived(_) => EventName::MessageReceived,
            Event::GroupMessageRead(_) => EventName::GroupMessageRead,
            Event::GroupMembershipChanged(Change::Added, _) => EventName::AddUserToGroup,
            Event::GroupMembershipChanged(Change::Removed, _) => EventName::RemoveUserFromGroup,
            Event::AdminChanged(Change::Added, _) => EventName::MadeAdmin,
            Event::AdminChanged(Change::Removed, _) => EventName::RemoveAdmin,
        }
    }

    /// Render the user-facing notification for this event.
    pub fn notification(&self) -> Notification {
        match self {
            Event::NewMessage(msg) => Notification::new(
                msg.sender_username.as_deref().unwrap_or("New message"),
                &msg.description,
            ),
            Event::EditMessage(msg) => Notification::new(
                msg.sender_username.as_deref().unwrap_or("Message edited"),
                &msg.description,
            ),
            Event::DeleteMessage(msg) => Notification::new("message deleted", msg.id.to_string()),
            Event::MessageReceived(msg) => {
                Notification::new("message received", msg.id.to_string())
            }
            Event::GroupMessageRead(msg) => Notification::new(
                "group message read",
                format!("{} read {}", msg.group_member_username, msg.id),
            ),
            Event::GroupMembershipChanged(change, group) => {
                let title = match change {
                    Change::Added => "added user to group",
                    Change::Removed => "removed user from group",
                };
                Notification::new(title, group.member_label())
            }
            Event::AdminChanged(change, group) => {
                let title = match change {
                    Change::Added => "made user admin",
                    Change::Removed => "removed user from admin",
                };
                Notification::new(title, group.member_label())
            }
        }
    }
}

impl GroupEvent {
    fn member_label(&self) -> String {
        format!("{} ({})", self.member.username, self.member.phonenumber)
    }
}

/// A notification ready for display: what the daemon hands to the desktop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Parse one envelope (`<EVENT_NAME>|<json>`) into an event.
///
/// Splits on the first separator only, so payloads may contain `|`.
pub fn parse_envelope(raw: &[u8]) -> Result<Event, FrameError> {
    let split = raw
        .iter()
        .position(|&b| b == ENVELOPE_SEPARATOR)
        .ok_or(FrameError::MalformedFrame)?;
    let (name, payload) = (&raw[..split], &raw[split + 1..]);

    let name: EventName = String::from_utf8_lossy(name).trim().parse()?;
    let decode_err = |source| FrameError::Decode {
        event: name,
        source,
    };

    let event = match name {
        EventName::NewMessage => {
            Event::NewMessage(serde_json::from_slice(payload).map_err(decode_err)?)
        }
        EventName::EditMessage => {
            Event::EditMessage(serde_json::from_slice(payload).map_err(decode_err)?)
        }
        EventName::DeleteMessage => {
            Event::DeleteMessage(serde_json::from_slice(payload).map_err(decode_err)?)
        }
        EventName::MessageReceived => {
            Event::MessageReceived(serde_json::from_slice(payload).map_err(decode_err)?)
        }
        EventName::GroupMessageRead => {
            Event::GroupMessageRead(serde_json::from_slice(payload).map_err(decode_err)?)
        }
        EventName::AddUserToGroup => Event::GroupMembershipChanged(
            Change::Added,
            serde_json::from_slice(payload).map_err(decode_err)?,
        ),
        EventName::RemoveUserFromGroup => Event::GroupMembershipChanged(
            Change::Removed,
            serde_json::from_slice(payload).map_err(decode_err)?,
        ),
        EventName::MadeAdmin => Event::AdminChanged(
            Change::Added,
            serde_json::from_slice(payload).map_err(decode_err)?,
        ),
        EventName::RemoveAdmin => Event::AdminChanged(
            Change::Removed,
            serde_json::from_slice(payload).map_err(decode_err)?,
        ),
    };

    Ok(event)
}

/// The server serializes "no group" as the nil UUID.
fn nil_as_none<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: Deserializer<'de>,
{
    let id = Option::<Uuid>::deserialize(deserializer)?;
    Ok(id.filter(|id| !id.is_nil()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG_ID: &str = "6f1c2a4e-8b7d-4c1e-9a3f-0d2b5e6c7a81";
    const SENDER_ID: &str = "1b2c3d4e-5f60-4718-8293-a4b5c6d7e8f9";
    const GROUP_ID: &str = "9e8d7c6b-5a49-4837-a261-5f4e3d2c1b0a";

    fn envelope(name: &str, payload: &str) -> Vec<u8> {
        format!("{}|{}", name, payload).into_bytes()
    }

    fn group_payload() -> String {
        format!(
            r#"{{"name":"rustaceans","group_id":"{GROUP_ID}","group":{{"id":"{SENDER_ID}","username":"ferris","phonenumber":"+15550100"}},"emittedAt":"2025-01-01T10:00:00Z"}}"#
        )
    }

    #[test]
    fn test_event_name_wire_names_roundtrip() {
        for name in EventName::ALL {
            assert_eq!(name.as_str().parse::<EventName>().unwrap(), name);
        }
        assert_eq!(EventName::MessageReceived.as_str(), "MARK_MESSAGE_RECEIVED");
    }

    #[test]
    fn test_parse_new_message() {
        let payload = format!(
            r#"{{"id":"{MSG_ID}","sender_id":"{SENDER_ID}","sender_username":"alice","description":"hi there","created_at":"2025-01-01T10:00:00Z"}}"#
        );
        let event = parse_envelope(&envelope("NEW_MESSAGE", &payload)).unwrap();

        assert_eq!(event.name(), EventName::NewMessage);
        assert_eq!(event.notification(), Notification::new("alice", "hi there"));
        match event {
            Event::NewMessage(msg) => {
                assert_eq!(msg.group_id, None);
                assert_eq!(msg.created_at.as_deref(), Some("2025-01-01T10:00:00Z"));
                assert_eq!(msg.updated_at, None);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_edit_message_without_username() {
        let payload = format!(
            r#"{{"id":"{MSG_ID}","group_id":"{GROUP_ID}","sender_id":"{SENDER_ID}","description":"fixed typo"}}"#
        );
        let event = parse_envelope(&envelope("EDIT_MESSAGE", &payload)).unwrap();

        assert_eq!(
            event.notification(),
            Notification::new("Message edited", "fixed typo")
        );
        match event {
            Event::EditMessage(msg) => {
                assert_eq!(msg.group_id, Some(GROUP_ID.parse().unwrap()));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_nil_group_id_is_none() {
        let payload = format!(
            r#"{{"id":"{MSG_ID}","sender_id":"{SENDER_ID}","group_id":"00000000-0000-0000-0000-000000000000"}}"#
        );
        match parse_envelope(&envelope("DELETE_MESSAGE", &payload)).unwrap() {
            Event::DeleteMessage(msg) => assert_eq!(msg.group_id, None),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_message_id_notifications() {
        let deleted = format!(r#"{{"id":"{MSG_ID}","sender_id":"{SENDER_ID}"}}"#);
        let received = format!(r#"{{"id":"{MSG_ID}","receiver_id":"{SENDER_ID}"}}"#);

        let event = parse_envelope(&envelope("DELETE_MESSAGE", &deleted)).unwrap();
        assert_eq!(event.notification(), Notification::new("message deleted", MSG_ID));

        let event = parse_envelope(&envelope("MARK_MESSAGE_RECEIVED", &received)).unwrap();
        assert_eq!(
            event.notification(),
            Notification::new("message received", MSG_ID)
        );
    }

    #[test]
    fn test_parse_group_message_read() {
        let payload = format!(
            r#"{{"id":"{MSG_ID}","group_id":"{GROUP_ID}","group_member_id":"{SENDER_ID}","group_member_username":"bob"}}"#
        );
        let event = parse_envelope(&envelope("GROUP_MESSAGE_READ", &payload)).unwrap();
        assert_eq!(
            event.notification(),
            Notification::new("group message read", format!("bob read {MSG_ID}"))
        );
    }

    #[test]
    fn test_group_events_share_schema() {
        let cases = [
            ("ADD_USER_TO_GROUP", "added user to group"),
            ("REMOVE_USER_FROM_GROUP", "removed user from group"),
            ("MADE_ADMIN", "made user admin"),
            ("REMOVE_ADMIN", "removed user from admin"),
        ];

        for (name, title) in cases {
            let event = parse_envelope(&envelope(name, &group_payload())).unwrap();
            assert_eq!(event.name().as_str(), name);
            assert_eq!(
                event.notification(),
                Notification::new(title, "ferris (+15550100)")
            );
        }
    }

    #[test]
    fn test_group_event_fields() {
        let event = parse_envelope(&envelope("MADE_ADMIN", &group_payload())).unwrap();
        match event {
            Event::AdminChanged(Change::Added, group) => {
                assert_eq!(group.name, "rustaceans");
                assert_eq!(group.group_id, Some(GROUP_ID.parse().unwrap()));
                assert_eq!(group.member.id, SENDER_ID.parse::<Uuid>().unwrap());
                assert_eq!(group.emitted_at.as_deref(), Some("2025-01-01T10:00:00Z"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_missing_separator_is_malformed() {
        let err = parse_envelope(b"NEW_MESSAGE {}").unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame));
        assert!(matches!(
            parse_envelope(b"").unwrap_err(),
            FrameError::MalformedFrame
        ));
    }

    #[test]
    fn test_unknown_event() {
        let err = parse_envelope(b"TYPING|{}").unwrap_err();
        match err {
            FrameError::UnknownEvent(name) => assert_eq!(name, "TYPING"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_bad_json_names_event() {
        let err = parse_envelope(b"NEW_MESSAGE|{not json").unwrap_err();
        assert_eq!(err.event(), Some(EventName::NewMessage));
        assert!(err.to_string().starts_with("failed to decode NEW_MESSAGE payload"));

        // Valid JSON with the wrong shape is a decode error too
        let err = parse_envelope(b"MARK_MESSAGE_RECEIVED|{\"id\":42}").unwrap_err();
        assert!(matches!(
            err,
            FrameError::Decode {
                event: EventName::MessageReceived,
                ..
            }
        ));
    }

    #[test]
    fn test_splits_on_first_separator_only() {
        let payload = format!(
            r#"{{"id":"{MSG_ID}","sender_id":"{SENDER_ID}","sender_username":"alice","description":"a|b|c"}}"#
        );
        let event = parse_envelope(&envelope("NEW_MESSAGE", &payload)).unwrap();
        assert_eq!(event.notification().body, "a|b|c");
    }
}
