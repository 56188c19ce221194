//! Relay Engine
//!
//! Pumps bytes between the WebSocket halves and the outbound TCP stream.
//!
//! - Upload: WebSocket frames -> body opener -> TCP write
//! - Download: TCP read -> body sealer -> WebSocket frames
//!
//! Writes are awaited before the next read, so a slow side throttles its
//! counterpart without any intermediate queue. TCP EOF ends the download
//! only; the upload keeps running until the client closes. The end of the
//! upload, any error, shutdown and the idle watchdog end both directions.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream as FuturesStream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::app::metrics::{TRAFFIC_BYTES_DOWNLOADED, TRAFFIC_BYTES_UPLOADED};
use crate::common::{Result, Stream};
use crate::error::Error;
use crate::protocol::{BodyOpener, BodySealer};

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Why the relay stopped
#[derive(Debug)]
pub enum RelayEnd {
    /// Client closed the WebSocket (or its stream ended)
    ClientClosed,
    /// No traffic in either direction for the idle timeout
    Idle,
    /// Process shutdown
    Shutdown,
    /// Read or write error on either side
    Failed(Error),
}

/// Byte counters for one session
#[derive(Debug, Default)]
pub struct Traffic {
    up: AtomicU64,
    down: AtomicU64,
}

impl Traffic {
    fn add_up(&self, n: usize) {
        self.up.fetch_add(n as u64, Ordering::Relaxed);
        TRAFFIC_BYTES_UPLOADED.inc_by(n as u64);
    }

    fn add_down(&self, n: usize) {
        self.down.fetch_add(n as u64, Ordering::Relaxed);
        TRAFFIC_BYTES_DOWNLOADED.inc_by(n as u64);
    }

    /// Plaintext bytes written to the destination
    pub fn up(&self) -> u64 {
        self.up.load(Ordering::Relaxed)
    }

    /// Plaintext bytes read from the destination
    pub fn down(&self) -> u64 {
        self.down.load(Ordering::Relaxed)
    }
}

/// Last time any byte moved, for the idle watchdog
pub(crate) struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Resolve once `timeout` has passed without a touch
    pub(crate) async fn expired(&self, timeout: Duration) {
        loop {
            let deadline = *self.last.lock() + timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Everything the relay needs, handed over by the session
pub(crate) struct RelayParts<'a, Tx, Rx> {
    pub tx: &'a mut Tx,
    pub rx: &'a mut Rx,
    pub outbound: Stream,
    pub opener: BodyOpener,
    pub sealer: BodySealer,
    /// Payload that arrived in the handshake frames, after the header
    pub early_data: Vec<u8>,
    pub idle_timeout: Duration,
    pub shutdown: &'a mut broadcast::Receiver<()>,
    pub traffic: &'a Traffic,
    pub tag: &'a str,
}

/// Run both directions until the session must end
pub(crate) async fn relay<Tx, Rx, E>(parts: RelayParts<'_, Tx, Rx>) -> RelayEnd
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
    Rx: FuturesStream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let RelayParts {
        tx,
        rx,
        outbound,
        mut opener,
        mut sealer,
        early_data,
        idle_timeout,
        shutdown,
        traffic,
        tag,
    } = parts;

    let (mut tcp_read, mut tcp_write) = tokio::io::split(outbound);
    let activity = Activity::new();
    let client_done = AtomicBool::new(false);
    let dest_done = AtomicBool::new(false);

    // Upload: client -> destination
    let upload = async {
        let mut plain = Vec::with_capacity(RELAY_BUFFER_SIZE);
        let mut client_eof = opener.open(&early_data, &mut plain)?;
        if !plain.is_empty() {
            tcp_write.write_all(&plain).await?;
            traffic.add_up(plain.len());
        }
        if client_eof {
            close_upstream(&mut tcp_write, &client_done, tag).await?;
            if dest_done.load(Ordering::SeqCst) {
                return Ok(());
            }
        }

        while let Some(msg) = rx.next().await {
            let data = match msg.map_err(|e| Error::WebSocket(e.to_string()))? {
                Message::Binary(data) => data,
                Message::Text(text) => text.into_bytes(),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {
                    activity.touch();
                    continue;
                }
            };
            activity.touch();
            if client_eof {
                continue;
            }

            plain.clear();
            client_eof = opener.open(&data, &mut plain)?;
            if !plain.is_empty() {
                tcp_write.write_all(&plain).await?;
                traffic.add_up(plain.len());
            }
            if client_eof {
                close_upstream(&mut tcp_write, &client_done, tag).await?;
                if dest_done.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
        Ok::<_, Error>(())
    };

    // Download: destination -> client
    let download = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut framed = Vec::with_capacity(RELAY_BUFFER_SIZE + 64);

        loop {
            let n = tcp_read.read(&mut buf).await?;
            framed.clear();
            if n == 0 {
                sealer.finish(&mut framed)?;
                if !framed.is_empty() {
                    send(&mut *tx, std::mem::take(&mut framed)).await?;
                }
                dest_done.store(true, Ordering::SeqCst);
                return Ok::<_, Error>(());
            }

            activity.touch();
            sealer.seal(&buf[..n], &mut framed)?;
            send(&mut *tx, std::mem::take(&mut framed)).await?;
            traffic.add_down(n);
        }
    };

    tokio::pin!(upload, download);
    let mut download_done = false;

    loop {
        tokio::select! {
            res = &mut upload => {
                return match res {
                    Ok(()) => RelayEnd::ClientClosed,
                    Err(e) => RelayEnd::Failed(e),
                };
            }
            res = &mut download, if !download_done => {
                match res {
                    Ok(()) if client_done.load(Ordering::SeqCst) => return RelayEnd::ClientClosed,
                    Ok(()) => {
                        debug!("[{}] Destination closed, waiting for client", tag);
                        download_done = true;
                    }
                    Err(e) => return RelayEnd::Failed(e),
                }
            }
            _ = activity.expired(idle_timeout) => return RelayEnd::Idle,
            _ = shutdown.recv() => return RelayEnd::Shutdown,
        }
    }
}

/// Half-close the destination once the client signalled end of stream
async fn close_upstream<W>(tcp_write: &mut W, client_done: &AtomicBool, tag: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!("[{}] Client finished sending, closing upstream write", tag);
    tcp_write.shutdown().await?;
    client_done.store(true, Ordering::SeqCst);
    Ok(())
}

async fn send<Tx>(tx: &mut Tx, data: Vec<u8>) -> Result<()>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    tx.send(Message::Binary(data))
        .await
        .map_err(|e| Error::WebSocket(e.to_string()))
}
