//! Notification sinks.
//!
//! The daemon's job ends at producing a [`Notification`]; how it reaches the
//! user depends on the platform and on `--notifier`.

use std::process::Stdio;

use anyhow::{Context, Result};
use terterchat_core::event::Notification;
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Application name shown by desktop notification daemons.
pub const APP_NAME: &str = "TerTerChat";

/// Something that can show a notification to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log. Works everywhere, including headless
/// machines and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        info!(title = %notification.title, "{}", notification.body);
        Ok(())
    }
}

/// Hands notifications to the desktop's notification service by spawning
/// `notify-send` (Linux/BSD) or `osascript` (macOS).
///
/// The helper is waited for on a background task, so a slow notification
/// daemon never stalls the read loop and finished helpers are reaped.
/// Must be called from within a tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopNotifier;

impl DesktopNotifier {
    fn command(notification: &Notification) -> Command {
        if cfg!(target_os = "macos") {
            let mut cmd = Command::new("osascript");
            cmd.arg("-e").arg(format!(
                "display notification {} with title {}",
                applescript_string(&notification.body),
                applescript_string(&format!("{}: {}", APP_NAME, notification.title)),
            ));
            cmd
        } else {
            let mut cmd = Command::new("notify-send");
            cmd.arg("--app-name")
                .arg(APP_NAME)
                .arg("--")
                .arg(&notification.title)
                .arg(&notification.body);
            cmd
        }
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        let runtime = Handle::try_current().context("Desktop notifications need a tokio runtime")?;

        let mut cmd = Self::command(notification);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        runtime.spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => debug!("{} exited with {}", program, status),
                Err(e) => warn!("Failed to wait for {}: {}", program, e),
            }
        });
        Ok(())
    }
}

/// Quote a string as an AppleScript literal.
fn applescript_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
