//! Session State Machine
//!
//! Responsibilities:
//! - Reassemble the handshake header from WebSocket frames
//! - Dispatch the decoded destination to the dialer
//! - Hand both connections to the relay engine
//! - Tear down with the close code matching the outcome
//!
//! ```text
//! AwaitingHandshake -> Handshaking -> Relaying -> Closing -> Closed
//!         \                  \            \
//!          +------------------+------------+-----> Failed
//! ```
//!
//! One session per accepted upgrade; nothing is shared between sessions
//! besides the read-only identity and dialer.

pub mod relay;

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream as FuturesStream, StreamExt};
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::app::metrics::{SessionMetrics, DIAL_FAILURES};
use crate::common::format_bytes;
use crate::identity::Identity;
use crate::protocol::{Decoded, Handshake, HandshakeHeader, HeaderError};
use crate::transport::{DialError, Dialer};

use self::relay::{relay, RelayEnd, RelayParts, Traffic};

/// Cap on buffered bytes while a header is still incomplete
const MAX_HANDSHAKE_BUFFER: usize = 4096;

/// Shared, read-only collaborators for every session
#[derive(Clone)]
pub struct SessionContext {
    pub identity: Arc<Identity>,
    pub dialer: Arc<dyn Dialer>,
    /// Bound on handshake wait and on relay inactivity
    pub idle_timeout: Duration,
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Handshaking,
    Relaying,
    Closing,
    Closed,
    Failed,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingHandshake => "awaiting-handshake",
            SessionState::Handshaking => "handshaking",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Relay ran and one side closed normally
    Completed,
    /// Client went away before a header was complete
    ClientGone,
    /// Header invalid or identity mismatch
    Rejected(HeaderError),
    /// Destination could not be reached
    DialFailed(DialError),
    /// Read or write error mid-relay
    RelayFailed(String),
    /// No traffic for the idle timeout
    IdleTimeout,
    /// Process shutdown
    Shutdown,
}

impl SessionEnd {
    /// Metrics label for failed outcomes
    fn failure_kind(&self) -> Option<&'static str> {
        match self {
            SessionEnd::Rejected(_) => Some("header"),
            SessionEnd::DialFailed(_) => Some("dial"),
            SessionEnd::RelayFailed(_) => Some("relay"),
            SessionEnd::IdleTimeout => Some("idle"),
            _ => None,
        }
    }

    /// Close frame to send, `None` to drop the connection without one
    fn close_frame(&self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            SessionEnd::Completed | SessionEnd::ClientGone => (close_code::NORMAL, ""),
            SessionEnd::IdleTimeout => (close_code::NORMAL, "idle timeout"),
            SessionEnd::Shutdown => (close_code::AWAY, "server shutting down"),
            SessionEnd::Rejected(_) => (close_code::PROTOCOL, "protocol error"),
            // Abrupt drop, seen by the client as 1006
            SessionEnd::DialFailed(_) | SessionEnd::RelayFailed(_) => return None,
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

/// Summary returned when a session is over
#[derive(Debug)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub header: Option<HandshakeHeader>,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// One tunnel session over a split WebSocket
pub struct Session<Tx, Rx> {
    tag: String,
    ctx: SessionContext,
    tx: Tx,
    rx: Rx,
    shutdown: broadcast::Receiver<()>,
    state: SessionState,
    traffic: Traffic,
    metrics: SessionMetrics,
    started: std::time::Instant,
}

enum HandshakeOutcome {
    Ready(Handshake, Vec<u8>),
    Ended(SessionEnd),
}

impl<Tx, Rx, E> Session<Tx, Rx>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
    Rx: FuturesStream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    pub fn new(
        tag: impl Into<String>,
        ctx: SessionContext,
        tx: Tx,
        rx: Rx,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            tag: tag.into(),
            ctx,
            tx,
            rx,
            shutdown,
            state: SessionState::AwaitingHandshake,
            traffic: Traffic::default(),
            metrics: SessionMetrics::start(),
            started: std::time::Instant::now(),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("[{}] {} -> {}", self.tag, self.state, next);
        self.state = next;
    }

    /// Drive the session to completion
    pub async fn run(mut self) -> SessionReport {
        let (end, header) = self.drive().await;

        if let Some(kind) = end.failure_kind() {
            self.metrics.record_failure(kind);
        }

        match end.close_frame() {
            Some(frame) => {
                self.transition(SessionState::Closing);
                // The peer may already be gone; nothing left to do then
                let _ = self.tx.send(Message::Close(Some(frame))).await;
                let _ = self.tx.close().await;
                self.transition(SessionState::Closed);
            }
            None => self.transition(SessionState::Failed),
        }

        let (up, down) = (self.traffic.up(), self.traffic.down());
        match (&end, &header) {
            (SessionEnd::Rejected(e), _) => warn!("[{}] Handshake rejected: {}", self.tag, e),
            (SessionEnd::DialFailed(e), Some(h)) => {
                warn!("[{}] Dial {} failed: {}", self.tag, h.destination, e)
            }
            (SessionEnd::RelayFailed(e), _) => warn!("[{}] Relay error: {}", self.tag, e),
            (_, Some(h)) => info!(
                "[{}] Closed: {} (↑{} ↓{}, {:.1?}, {:?})",
                self.tag,
                h.destination,
                format_bytes(up),
                format_bytes(down),
                self.started.elapsed(),
                end
            ),
            (_, None) => debug!("[{}] Closed before handshake: {:?}", self.tag, end),
        }

        SessionReport {
            end,
            header,
            bytes_up: up,
            bytes_down: down,
        }
    }

    async fn drive(&mut self) -> (SessionEnd, Option<HandshakeHeader>) {
        let (handshake, early_data) = match self.read_handshake().await {
            HandshakeOutcome::Ready(handshake, early) => (handshake, early),
            HandshakeOutcome::Ended(end) => return (end, None),
        };
        let Handshake { header, codec, .. } = handshake;

        debug!(
            "[{}] {} {} -> {}",
            self.tag,
            self.ctx.identity.framing(),
            header.command,
            header.destination
        );

        let dialer = Arc::clone(&self.ctx.dialer);
        let outbound = tokio::select! {
            res = dialer.dial(&header.destination) => match res {
                Ok(stream) => stream,
                Err(e) => {
                    DIAL_FAILURES.with_label_values(&[e.reason()]).inc();
                    return (SessionEnd::DialFailed(e), Some(header));
                }
            },
            _ = self.shutdown.recv() => return (SessionEnd::Shutdown, Some(header)),
        };

        info!("[{}] Relaying to {}", self.tag, header.destination);
        self.transition(SessionState::Relaying);

        let (opener, sealer) = codec.split();
        let end = relay(RelayParts {
            tx: &mut self.tx,
            rx: &mut self.rx,
            outbound,
            opener,
            sealer,
            early_data,
            idle_timeout: self.ctx.idle_timeout,
            shutdown: &mut self.shutdown,
            traffic: &self.traffic,
            tag: &self.tag,
        })
        .await;

        let end = match end {
            RelayEnd::ClientClosed => SessionEnd::Completed,
            RelayEnd::Idle => SessionEnd::IdleTimeout,
            RelayEnd::Shutdown => SessionEnd::Shutdown,
            RelayEnd::Failed(e) => SessionEnd::RelayFailed(e.to_string()),
        };
        (end, Some(header))
    }

    /// Buffer frames until the header decodes, fails, or the client leaves
    async fn read_handshake(&mut self) -> HandshakeOutcome {
        let framing = self.ctx.identity.framing();
        let deadline = Instant::now() + self.ctx.idle_timeout;
        let mut buf: Vec<u8> = Vec::new();

        loop {
            let msg = tokio::select! {
                msg = self.rx.next() => msg,
                _ = sleep_until(deadline) => return HandshakeOutcome::Ended(SessionEnd::IdleTimeout),
                _ = self.shutdown.recv() => return HandshakeOutcome::Ended(SessionEnd::Shutdown),
            };

            let data = match msg {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    return HandshakeOutcome::Ended(SessionEnd::ClientGone)
                }
                Some(Err(e)) => {
                    debug!("[{}] WebSocket error before handshake: {}", self.tag, e);
                    return HandshakeOutcome::Ended(SessionEnd::ClientGone);
                }
            };

            if buf.is_empty() {
                buf = data;
            } else {
                buf.extend_from_slice(&data);
            }
            if self.state == SessionState::AwaitingHandshake {
                self.transition(SessionState::Handshaking);
            }

            match framing.decode(&buf, &self.ctx.identity) {
                Ok(Decoded::Complete(handshake)) => {
                    let early = buf.split_off(handshake.payload_offset);
                    return HandshakeOutcome::Ready(handshake, early);
                }
                Ok(Decoded::NeedMoreData) if buf.len() >= MAX_HANDSHAKE_BUFFER => {
                    return HandshakeOutcome::Ended(SessionEnd::Rejected(HeaderError::Malformed(
                        "header exceeds size limit",
                    )));
                }
                Ok(Decoded::NeedMoreData) => {
                    debug!("[{}] Partial header, {} bytes buffered", self.tag, buf.len());
                }
                Err(e) => return HandshakeOutcome::Ended(SessionEnd::Rejected(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Stream};
    use crate::protocol::{vless, vmess, Command, Framing};
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use parking_lot::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use uuid::Uuid;

    const ID: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";

    type ClientTx = mpsc::UnboundedSender<std::result::Result<Message, std::io::Error>>;
    type ClientRx = mpsc::UnboundedReceiver<Message>;

    /// Hands out one end of an in-memory pipe and records dial targets
    #[derive(Default)]
    struct PipeDialer {
        dialed: Mutex<Vec<Address>>,
        peer: Mutex<Option<DuplexStream>>,
        fail: Option<DialError>,
    }

    #[async_trait]
    impl Dialer for PipeDialer {
        async fn dial(&self, target: &Address) -> std::result::Result<Stream, DialError> {
            self.dialed.lock().push(target.clone());
            if let Some(e) = &self.fail {
                return Err(e.clone());
            }
            let (ours, theirs) = duplex(64 * 1024);
            *self.peer.lock() = Some(theirs);
            Ok(Box::new(ours))
        }
    }

    fn identity(framing: Framing) -> Arc<Identity> {
        Arc::new(Identity::new(Uuid::parse_str(ID).unwrap(), framing))
    }

    fn spawn_session(
        identity: Arc<Identity>,
        dialer: Arc<PipeDialer>,
        idle_timeout: Duration,
    ) -> (ClientTx, ClientRx, broadcast::Sender<()>, tokio::task::JoinHandle<SessionReport>) {
        let (client_tx, rx) = mpsc::unbounded();
        let (tx, client_rx) = mpsc::unbounded();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let ctx = SessionContext {
            identity,
            dialer,
            idle_timeout,
        };
        let handle = tokio::spawn(Session::new("test", ctx, tx, rx, shutdown_rx).run());
        (client_tx, client_rx, shutdown, handle)
    }

    fn vless_header(id: &Identity, dest: Address) -> Vec<u8> {
        vless::encode_request(&HandshakeHeader {
            version: vless::VERSION,
            client_id: *id.id_bytes(),
            instruction: Vec::new(),
            command: Command::Tcp,
            destination: dest,
        })
        .unwrap()
    }

    async fn wait_for_peer(dialer: &PipeDialer) -> DuplexStream {
        loop {
            if let Some(peer) = dialer.peer.lock().take() {
                return peer;
            }
            tokio::task::yield_now().await;
        }
    }

    fn close_code_of(msg: Option<Message>) -> Option<u16> {
        match msg {
            Some(Message::Close(Some(frame))) => Some(frame.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_header_split_into_single_bytes() {
        let id = identity(Framing::Vless);
        let dialer = Arc::new(PipeDialer::default());
        let (client_tx, mut client_rx, _shutdown, handle) =
            spawn_session(id.clone(), dialer.clone(), Duration::from_secs(30));

        let mut wire = vless_header(&id, Address::domain("example.com", 80));
        wire.extend_from_slice(b"ping");
        for byte in wire {
            client_tx.unbounded_send(Ok(Message::Binary(vec![byte]))).unwrap();
        }

        let mut dest = wait_for_peer(&dialer).await;
        let mut buf = [0u8; 4];
        dest.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(dialer.dialed.lock()[0], Address::domain("example.com", 80));

        dest.write_all(b"pong").await.unwrap();
        let reply = match client_rx.next().await {
            Some(Message::Binary(data)) => data,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(reply, vec![0, 0, b'p', b'o', b'n', b'g']);

        client_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        let report = handle.await.unwrap();
        assert!(matches!(report.end, SessionEnd::Completed));
        assert_eq!((report.bytes_up, report.bytes_down), (4, 4));
        assert_eq!(close_code_of(client_rx.next().await), Some(close_code::NORMAL));
    }

    #[tokio::test]
    async fn test_header_with_addons_split_into_single_bytes() {
        let id = identity(Framing::Vless);
        let dialer = Arc::new(PipeDialer::default());
        let (client_tx, _client_rx, _shutdown, _handle) =
            spawn_session(id.clone(), dialer.clone(), Duration::from_secs(30));

        let mut wire = vless::encode_request(&HandshakeHeader {
            version: vless::VERSION,
            client_id: *id.id_bytes(),
            instruction: vec![0x0a, 0x02, 0x01, 0x02],
            command: Command::Tcp,
            destination: Address::domain("example.com", 8443),
        })
        .unwrap();
        wire.extend_from_slice(b"hello");
        for byte in wire {
            client_tx.unbounded_send(Ok(Message::Binary(vec![byte]))).unwrap();
        }

        let mut dest = wait_for_peer(&dialer).await;
        let mut buf = [0u8; 5];
        dest.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(*dialer.dialed.lock(), vec![Address::domain("example.com", 8443)]);
    }

    #[tokio::test]
    async fn test_identity_mismatch_closes_with_protocol_error_and_never_dials() {
        let id = identity(Framing::Vless);
        let dialer = Arc::new(PipeDialer::default());
        let (client_tx, mut client_rx, _shutdown, handle) =
            spawn_session(id.clone(), dialer.clone(), Duration::from_secs(30));

        let mut wire = vless_header(&id, Address::domain("example.com", 80));
        wire[5] ^= 0x01;
        client_tx.unbounded_send(Ok(Message::Binary(wire))).unwrap();

        let report = handle.await.unwrap();
        assert!(matches!(report.end, SessionEnd::Rejected(HeaderError::IdentityMismatch)));
        assert_eq!(close_code_of(client_rx.next().await), Some(close_code::PROTOCOL));
        assert!(dialer.dialed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure_drops_without_close_frame() {
        let id = identity(Framing::Vless);
        let dialer = Arc::new(PipeDialer {
            fail: Some(DialError::Refused),
            ..Default::default()
        });
        let (client_tx, mut client_rx, _shutdown, handle) =
            spawn_session(id.clone(), dialer.clone(), Duration::from_secs(30));

        let wire = vless_header(&id, Address::from_host("93.184.216.34", 443));
        client_tx.unbounded_send(Ok(Message::Binary(wire))).unwrap();

        let report = handle.await.unwrap();
        assert!(matches!(report.end, SessionEnd::DialFailed(DialError::Refused)));
        assert_eq!(report.bytes_up, 0);
        // Sink dropped with the session, no close frame queued
        assert!(client_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_with_going_away() {
        let id = identity(Framing::Vless);
        let dialer = Arc::new(PipeDialer::default());
        let (client_tx, mut client_rx, shutdown, handle) =
            spawn_session(id.clone(), dialer.clone(), Duration::from_secs(30));

        let wire = vless_header(&id, Address::domain("example.com", 80));
        client_tx.unbounded_send(Ok(Message::Binary(wire))).unwrap();
        let _dest = wait_for_peer(&dialer).await;

        shutdown.send(()).unwrap();
        let report = handle.await.unwrap();
        assert!(matches!(report.end, SessionEnd::Shutdown));
        assert_eq!(close_code_of(client_rx.next().await), Some(close_code::AWAY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_handshake_times_out() {
        let dialer = Arc::new(PipeDialer::default());
        let (_client_tx, mut client_rx, _shutdown, handle) =
            spawn_session(identity(Framing::Vless), dialer, Duration::from_secs(10));

        let report = handle.await.unwrap();
        assert!(matches!(report.end, SessionEnd::IdleTimeout));
        assert!(report.header.is_none());
        assert_eq!(close_code_of(client_rx.next().await), Some(close_code::NORMAL));
    }

    #[tokio::test]
    async fn test_vmess_session_round_trip() {
        let id = identity(Framing::Vmess);
        let dialer = Arc::new(PipeDialer::default());
        let (client_tx, mut client_rx, _shutdown, handle) =
            spawn_session(id.clone(), dialer.clone(), Duration::from_secs(30));

        let request = vmess::Request::new(
            Address::domain("example.com", 443),
            vmess::Security::Chacha20Poly1305,
            vmess::option::CHUNK_STREAM | vmess::option::CHUNK_MASKING,
        );
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let mut wire = request.encode(&vmess::cmd_key(&id.id()), now).unwrap();
        let mut writer = vmess::body::ChunkWriter::new(&request.request_body()).unwrap();
        writer.write(b"hello", &mut wire).unwrap();
        client_tx.unbounded_send(Ok(Message::Binary(wire))).unwrap();

        let mut dest = wait_for_peer(&dialer).await;
        let mut buf = [0u8; 5];
        dest.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        dest.write_all(b"world").await.unwrap();
        let downstream = match client_rx.next().await {
            Some(Message::Binary(data)) => data,
            other => panic!("unexpected {:?}", other),
        };
        let resp = request.response_body();
        let (header, used) = vmess::aead::open_response_header(&resp.key, &resp.iv, &downstream)
            .unwrap()
            .unwrap();
        assert_eq!(header[0], request.response_auth);
        let mut reader = vmess::body::ChunkReader::new(&resp).unwrap();
        let mut plain = Vec::new();
        reader.feed(&downstream[used..], &mut plain).unwrap();
        assert_eq!(plain, b"world");

        drop(client_tx);
        let report = handle.await.unwrap();
        assert!(matches!(report.end, SessionEnd::Completed));
    }
}
