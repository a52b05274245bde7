//! The secure channel: one TLS connection to the chat server.
//!
//! After the handshake the client announces its phone number (raw, no
//! newline), then two loops run side by side until shutdown:
//!
//! - the read loop takes newline-terminated frames, answers keep-alive tokens
//!   through the outbound queue and hands everything else to the
//!   [`Dispatcher`];
//! - the write loop drains the outbound queue and sends a keep-alive `ping`
//!   on a fixed interval.
//!
//! Timeouts on either side are not fatal. Any other I/O error, or EOF, ends
//! the loop that saw it and triggers daemon shutdown. There is no reconnect.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::ServerName;
use terterchat_core::protocol::{ping_frame, ConnectionState, Frame, FRAME_DELIMITER};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::daemon::dispatch::Dispatcher;
use crate::daemon::shutdown::{Shutdown, ShutdownReason};
use crate::daemon::state::SharedConnectionState;
use crate::daemon::tls::{self, TlsFiles};

/// Default server address.
pub const DEFAULT_SERVER_ADDR: &str = "localhost:8081";

/// Interval between keep-alive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Bound on a single frame read before the loop re-arms.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a single frame write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the outbound queue between the two loops.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 10;

/// Bound on TCP connect plus TLS handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest inbound frame accepted (1 MB). A longer line is a protocol
/// violation and closes the connection.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frames travelling through the outbound queue.
type OutboundFrame = &'static [u8];

/// Everything needed to open and run the channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// `host:port` of the chat server.
    pub server_addr: String,
    /// Name checked against the server certificate.
    pub server_name: String,
    pub tls: TlsFiles,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            server_name: host_of(DEFAULT_SERVER_ADDR).to_string(),
            tls: TlsFiles::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

/// Host part of a `host:port` address, brackets stripped for IPv6.
pub fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Open the TCP connection and run the pinned TLS handshake.
pub async fn connect(config: &ChannelConfig) -> Result<TlsStream<TcpStream>> {
    let tls_config = tls::client_config(&config.tls).context("Failed to load TLS credentials")?;
    let server_name = ServerName::try_from(config.server_name.clone())
        .map_err(|e| anyhow!("Invalid server name '{}': {}", config.server_name, e))?;

    let handshake = async {
        let tcp = TcpStream::connect(&config.server_addr)
            .await
            .with_context(|| format!("Failed to connect to {}", config.server_addr))?;
        TlsConnector::from(tls_config)
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with {} failed", config.server_addr))
    };

    timeout(CONNECT_TIMEOUT, handshake)
        .await
        .with_context(|| format!("Timed out connecting to {}", config.server_addr))?
}

/// The daemon's single connection to the chat server.
pub struct SecureChannel {
    config: ChannelConfig,
    state: SharedConnectionState,
    dispatcher: Dispatcher,
    shutdown: Shutdown,
}

impl SecureChannel {
    pub fn new(
        config: ChannelConfig,
        state: SharedConnectionState,
        dispatcher: Dispatcher,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config,
            state,
            dispatcher,
            shutdown,
        }
    }

    /// Connect, announce `phone`, and serve until shutdown.
    ///
    /// Returns an error only when the connection could not be established;
    /// failures after that end in a shutdown trigger and `Ok(())`.
    pub async fn run(&self, phone: &str) -> Result<()> {
        self.state.set(ConnectionState::Connecting);
        info!("Connecting to {}", self.config.server_addr);

        let stream = tokio::select! {
            result = connect(&self.config) => result,
            _ = self.shutdown.wait() => {
                info!("Shutdown requested before connection was established");
                self.state.set(ConnectionState::Disconnected);
                return Ok(());
            }
        };

        match stream {
            Ok(stream) => self.serve(stream, phone).await,
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Announce `phone` on an established stream and run both loops.
    pub async fn serve<S>(&self, mut stream: S, phone: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let announced = timeout(self.config.write_timeout, async {
            stream.write_all(phone.as_bytes()).await?;
            stream.flush().await
        })
        .await;
        match announced {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(e).context("Failed to announce identity");
            }
            Err(_) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(anyhow!("Timed out announcing identity"));
            }
        }

        self.state.set(ConnectionState::Connected);
        info!("Connected to {}", self.config.server_addr);

        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.queue_capacity);

        tokio::join!(
            read_loop(
                reader,
                outbound_tx,
                &self.dispatcher,
                &self.shutdown,
                self.config.read_timeout,
            ),
            write_loop(
                writer,
                outbound_rx,
                &self.shutdown,
                self.config.ping_interval,
                self.config.write_timeout,
            ),
        );

        self.state.set(ConnectionState::Disconnected);
        info!("Connection to server closed");
        Ok(())
    }
}

/// Read frames until EOF, a fatal error, or shutdown.
///
/// The outbound sender is dropped on return, which closes the queue.
async fn read_loop<R>(
    reader: R,
    outbound: mpsc::Sender<OutboundFrame>,
    dispatcher: &Dispatcher,
    shutdown: &Shutdown,
    read_timeout: Duration,
) where
    R: AsyncRead + Unpin,
{
    debug!("Read loop started");
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);

    loop {
        // Partial frames survive a timeout: read_until appends what it has.
        let limit = (MAX_FRAME_SIZE - buf.len()) as u64 + 1;
        let mut limited = (&mut reader).take(limit);
        let read = tokio::select! {
            _ = shutdown.wait() => break,
            read = timeout(
                read_timeout,
                limited.read_until(FRAME_DELIMITER, &mut buf),
            ) => read,
        };

        match read {
            Err(_) => {
                debug!("No frame within {:?}, still waiting", read_timeout);
                continue;
            }
            Ok(Ok(0)) => {
                shutdown.trigger(ShutdownReason::ChannelClosed(
                    "server closed the connection".to_string(),
                ));
                break;
            }
            Ok(Err(e)) => {
                shutdown.trigger(ShutdownReason::ChannelClosed(format!("read failed: {}", e)));
                break;
            }
            Ok(Ok(_)) => {}
        }

        if buf.last() != Some(&FRAME_DELIMITER) {
            if buf.len() > MAX_FRAME_SIZE {
                shutdown.trigger(ShutdownReason::ChannelClosed(format!(
                    "frame exceeded {} bytes",
                    MAX_FRAME_SIZE
                )));
                break;
            }
            // EOF in the middle of a frame; the next read reports it.
            continue;
        }

        let frame = Frame::classify(&buf);
        if let Some(reply) = frame.keepalive_reply() {
            debug!("Keep-alive {:?} received", frame);
            let sent = tokio::select! {
                _ = shutdown.wait() => break,
                sent = outbound.send(reply) => sent,
            };
            if sent.is_err() {
                debug!("Outbound queue closed, stopping read loop");
                break;
            }
        } else if let Frame::Envelope(raw) = frame {
            if raw.is_empty() {
                debug!("Ignoring empty frame");
            } else {
                dispatcher.handle(raw);
            }
        }
        buf.clear();
    }

    debug!("Read loop stopped");
}

/// Write queued frames and keep-alive pings until shutdown or a fatal error.
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    shutdown: &Shutdown,
    ping_interval: Duration,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    debug!("Write loop started");
    let mut keepalive = interval_at(Instant::now() + ping_interval, ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = shutdown.wait() => break,
            queued = outbound.recv() => match queued {
                Some(frame) => frame,
                None => {
                    debug!("Outbound queue closed");
                    break;
                }
            },
            _ = keepalive.tick() => {
                debug!("Sending keep-alive ping");
                ping_frame()
            }
        };

        match timeout(write_timeout, write_frame(&mut writer, frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                shutdown.trigger(ShutdownReason::ChannelClosed(format!("write failed: {}", e)));
                break;
            }
            // The frame may be partly on the wire; the server sees it truncated.
            Err(_) => warn!(
                "Write timed out after {:?}, frame dropped (possibly partly sent)",
                write_timeout
            ),
        }
    }

    // Best effort close_notify; the peer may already be gone.
    match timeout(write_timeout, writer.shutdown()).await {
        Ok(Ok(())) => debug!("Sent close to server"),
        Ok(Err(e)) => debug!("Failed to close connection cleanly: {}", e),
        Err(_) => debug!("Timed out closing connection"),
    }
    debug!("Write loop stopped");
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::notify::tests::RecordingNotifier;
    use std::sync::Arc;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    const PHONE: &str = "+15550100";
    const NEW_MESSAGE: &str = r#"NEW_MESSAGE|{"id":"6f1c2a4e-8b7d-4c1e-9a3f-0d2b5e6c7a81","sender_id":"1b2c3d4e-5f60-4718-8293-a4b5c6d7e8f9","sender_username":"alice","description":"hi"}"#;

    struct Harness {
        channel: SecureChannel,
        state: SharedConnectionState,
        shutdown: Shutdown,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(ping_interval: Duration) -> Harness {
        let state = SharedConnectionState::new();
        let shutdown = Shutdown::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let config = ChannelConfig {
            ping_interval,
            ..ChannelConfig::default()
        };
        let channel = SecureChannel::new(
            config,
            state.clone(),
            Dispatcher::new(notifier.clone()),
            shutdown.clone(),
        );
        Harness {
            channel,
            state,
            shutdown,
            notifier,
        }
    }

    /// Peer side of a duplex pipe, with the identity already consumed.
    async fn accept_identity(
        peer: DuplexStream,
    ) -> (BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>) {
        let (reader, writer) = tokio::io::split(peer);
        let mut reader = BufReader::new(reader);
        let mut phone = vec![0u8; PHONE.len()];
        reader.read_exact(&mut phone).await.unwrap();
        assert_eq!(phone, PHONE.as_bytes());
        (reader, writer)
    }

    async fn read_frame<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for frame")
            .unwrap();
        line
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("localhost:8081"), "localhost");
        assert_eq!(host_of("chat.example.com:443"), "chat.example.com");
        assert_eq!(host_of("[::1]:8081"), "::1");
        assert_eq!(host_of("chat.example.com"), "chat.example.com");
    }

    #[tokio::test]
    async fn test_read_loop_enqueues_one_reply_per_keepalive() {
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::new(notifier.clone());
        let shutdown = Shutdown::new();
        let input = format!("ping\n{}\npong\n\n", NEW_MESSAGE);

        read_loop(
            input.as_bytes(),
            tx,
            &dispatcher,
            &shutdown,
            DEFAULT_READ_TIMEOUT,
        )
        .await;

        let mut replies = Vec::new();
        while let Some(frame) = rx.recv().await {
            replies.push(frame);
        }
        assert_eq!(replies, vec![&b"pong\n"[..], &b"ping\n"[..]]);
        assert_eq!(notifier.taken().len(), 1);

        // EOF is fatal
        assert!(matches!(
            shutdown.reason(),
            Some(ShutdownReason::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_loop_survives_bad_frames() {
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::new(notifier.clone());
        let shutdown = Shutdown::new();
        let input = format!(
            "no separator\nUNKNOWN|{{}}\nNEW_MESSAGE|{{broken\n{}\n",
            NEW_MESSAGE
        );

        read_loop(
            input.as_bytes(),
            tx,
            &dispatcher,
            &shutdown,
            DEFAULT_READ_TIMEOUT,
        )
        .await;

        assert_eq!(notifier.taken().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let dispatcher = Dispatcher::new(Arc::new(RecordingNotifier::default()));
        let shutdown = Shutdown::new();
        let input = vec![b'x'; MAX_FRAME_SIZE + 10];

        read_loop(
            &input[..],
            tx,
            &dispatcher,
            &shutdown,
            DEFAULT_READ_TIMEOUT,
        )
        .await;

        match shutdown.reason() {
            Some(ShutdownReason::ChannelClosed(cause)) => assert!(cause.contains("exceeded")),
            other => panic!("unexpected reason {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_serve_announces_identity_and_answers_keepalives() {
        let h = harness(Duration::from_secs(3600));
        let (client, peer) = duplex(4096);
        assert_eq!(h.state.get(), ConnectionState::Disconnected);

        let peer_task = async {
            let (mut reader, mut writer) = accept_identity(peer).await;

            writer.write_all(b"ping\n").await.unwrap();
            assert_eq!(read_frame(&mut reader).await, "pong\n");
            assert_eq!(h.state.get(), ConnectionState::Connected);

            writer.write_all(b"pong\n").await.unwrap();
            assert_eq!(read_frame(&mut reader).await, "ping\n");

            writer
                .write_all(format!("{}\n", NEW_MESSAGE).as_bytes())
                .await
                .unwrap();
            // Server goes away
            writer.shutdown().await.unwrap();

            // Channel closes its side in turn
            assert_eq!(read_frame(&mut reader).await, "");
        };

        let (served, ()) = tokio::join!(h.channel.serve(client, PHONE), peer_task);
        served.unwrap();

        assert_eq!(h.state.get(), ConnectionState::Disconnected);
        assert_eq!(h.notifier.taken().len(), 1);
        assert!(matches!(
            h.shutdown.reason(),
            Some(ShutdownReason::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection() {
        let h = harness(Duration::from_secs(3600));
        let (client, peer) = duplex(4096);

        let peer_task = async {
            let (mut reader, _writer) = accept_identity(peer).await;
            h.shutdown.trigger(ShutdownReason::DisconnectCommand);
            // EOF once the channel has shut its write side
            assert_eq!(read_frame(&mut reader).await, "");
        };

        let (served, ()) = tokio::join!(h.channel.serve(client, PHONE), peer_task);
        served.unwrap();
        assert_eq!(h.state.get(), ConnectionState::Disconnected);
        assert_eq!(
            h.shutdown.reason(),
            Some(&ShutdownReason::DisconnectCommand)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_not_fatal() {
        let h = harness(Duration::from_secs(3600));
        let (client, peer) = duplex(4096);

        let peer_task = async {
            let (mut reader, mut writer) = accept_identity(peer).await;

            // Half a frame, then silence across several read timeouts
            writer.write_all(b"pi").await.unwrap();
            tokio::time::sleep(DEFAULT_READ_TIMEOUT * 3).await;
            assert!(!h.shutdown.is_triggered());
            assert!(h.state.get().is_connected());

            writer.write_all(b"ng\n").await.unwrap();
            assert_eq!(read_frame(&mut reader).await, "pong\n");

            h.shutdown.trigger(ShutdownReason::Signal("SIGTERM"));
        };

        let (served, ()) = tokio::join!(h.channel.serve(client, PHONE), peer_task);
        served.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ticks_and_frames_do_not_deadlock() {
        const ROUNDS: usize = 1000;
        let ping_interval = Duration::from_secs(1);
        let h = harness(ping_interval);
        // Small pipe so back-pressure actually kicks in
        let (client, peer) = duplex(64);

        let peer_task = async {
            let (mut reader, mut writer) = accept_identity(peer).await;

            let send = async {
                for _ in 0..ROUNDS {
                    tokio::time::sleep(ping_interval).await;
                    writer
                        .write_all(format!("{}\nping\n", NEW_MESSAGE).as_bytes())
                        .await
                        .unwrap();
                }
                // Let the last reply drain before the server hangs up
                tokio::time::sleep(ping_interval * 2).await;
                writer.shutdown().await.unwrap();
            };

            let receive = async {
                let (mut pongs, mut pings) = (0, 0);
                loop {
                    let line = read_frame(&mut reader).await;
                    match line.as_str() {
                        "" => break,
                        "pong\n" => pongs += 1,
                        "ping\n" => pings += 1,
                        other => panic!("unexpected frame {:?}", other),
                    }
                }
                (pongs, pings)
            };

            let ((), counts) = tokio::join!(send, receive);
            counts
        };

        let (served, (pongs, pings)) = timeout(
            Duration::from_secs(ROUNDS as u64 * 10),
            async { tokio::join!(h.channel.serve(client, PHONE), peer_task) },
        )
        .await
        .expect("channel deadlocked");

        served.unwrap();
        assert_eq!(pongs, ROUNDS);
        assert!(pings >= ROUNDS - 1, "only {} keep-alive pings", pings);
        assert_eq!(h.notifier.taken().len(), ROUNDS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_is_not_fatal() {
        let shutdown = Shutdown::new();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        // Smaller than one frame and never drained until later
        let (writer, mut peer) = duplex(4);

        let peer_task = async {
            tx.send(&b"pong\n"[..]).await.unwrap();
            tokio::time::sleep(DEFAULT_WRITE_TIMEOUT * 3).await;
            assert!(!shutdown.is_triggered());

            let mut head = [0u8; 4];
            peer.read_exact(&mut head).await.unwrap();
            assert_eq!(&head, b"pong");

            // Loop is still serving the queue
            tx.send(&b"ping\n"[..]).await.unwrap();
            let mut next = [0u8; 4];
            timeout(DEFAULT_WRITE_TIMEOUT, peer.read_exact(&mut next))
                .await
                .expect("queue stalled after a timed out write")
                .unwrap();
            assert_eq!(&next, b"ping");

            shutdown.trigger(ShutdownReason::Signal("SIGTERM"));
        };

        tokio::join!(
            write_loop(
                writer,
                rx,
                &shutdown,
                Duration::from_secs(3600),
                DEFAULT_WRITE_TIMEOUT,
            ),
            peer_task,
        );
        assert_eq!(shutdown.reason(), Some(&ShutdownReason::Signal("SIGTERM")));
    }

    #[tokio::test]
    async fn test_run_fails_without_credentials() {
        let dir = std::env::temp_dir().join(format!(
            "terterchat-nocreds-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let state = SharedConnectionState::new();
        let config = ChannelConfig {
            tls: TlsFiles::in_dir(&dir),
            ..ChannelConfig::default()
        };
        let channel = SecureChannel::new(
            config,
            state.clone(),
            Dispatcher::new(Arc::new(RecordingNotifier::default())),
            Shutdown::new(),
        );

        let err = channel.run(PHONE).await.unwrap_err();
        assert!(format!("{:#}", err).contains("TLS credentials"));
        assert_eq!(state.get(), ConnectionState::Disconnected);
    }
}
