//! Resilient per-device TCP transport
//!
//! `TcpStream::connect` with a timeout and header-then-body reads,
//! reconnecting with backoff behind a standing reader task that emits frames
//! onto the bus instead of a single request/response round trip held behind
//! one lock. The reconnect loop shape (spawn, cancel, respawn) and the
//! `CancellationToken`-driven shutdown are grounded on `iadev09-bouncer`'s
//! `bouncer-helpers::shutdown` and its accept-loop `tokio::select!` pattern.
//! The `BytesMut` frame accumulation buffer follows the framed-TCP-protocol
//! style seen in the retrieval pack's `egill-Avero` example.

use std::fmt;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::bus::{Event, SharedBus};

const READ_CHUNK: usize = 4096;
const HEADER_LEN: usize = 16;

#[derive(Debug)]
pub enum TransportError {
    /// `write` was called after the transport was closed.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport is closed"),
        }
    }
}

impl std::error::Error for TransportError {}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub address: String,
    pub port: u16,
    pub timeout: Duration,
    pub backoff: Backoff,
}

/// Handle to a running transport task. Dropping it does not close the
/// socket; call `close().await` for a planned shutdown.
pub struct Transport {
    write_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Transport {
    /// Registers a `DataSent` listener (Sender emits the frames it wants
    /// written) and spawns the connect/reconnect/reader task.
    pub fn start(bus: SharedBus, config: TransportConfig) -> Self {
        let cancel = CancellationToken::new();
        let (write_tx, write_rx) = mpsc::channel(32);

        let forward = write_tx.clone();
        bus.register(
            crate::bus::EventKind::DataSent,
            std::sync::Arc::new(move |event| {
                let forward = forward.clone();
                Box::pin(async move {
                    if let Event::DataSent(frame) = event {
                        forward
                            .send(frame)
                            .await
                            .map_err(|_| -> Box<dyn std::error::Error + Send + Sync> { "transport is closed".into() })?;
                    }
                    Ok(())
                })
            }),
        );

        let task = tokio::spawn(run(bus, config, write_rx, cancel.clone()));
        Self {
            write_tx,
            cancel,
            task,
        }
    }

    /// Queue a frame for writing directly, bypassing the bus. Not used by
    /// Sender (which emits `DataSent` instead) but kept for tests and for
    /// any future caller that doesn't want to round-trip through the bus.
    pub async fn write(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.write_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Planned close: cancel the run loop and wait for it to exit.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run(bus: SharedBus, config: TransportConfig, mut write_rx: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
    let mut backoff = config.backoff.clone();

    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => {
                bus.emit(Event::ConnectionClosed(None)).await;
                return;
            }
            stream = connect_with_backoff(&config, &mut backoff, &cancel) => {
                match stream {
                    Some(stream) => stream,
                    None => {
                        bus.emit(Event::ConnectionClosed(None)).await;
                        return;
                    }
                }
            }
        };

        bus.emit(Event::ConnectionEstablished).await;
        let outcome = serve_connection(stream, &bus, &mut write_rx, &cancel, &mut backoff).await;

        match outcome {
            ConnectionOutcome::PlannedClose => {
                bus.emit(Event::ConnectionClosed(None)).await;
                return;
            }
            ConnectionOutcome::Lost(reason) => {
                bus.emit(Event::ConnectionClosed(Some(reason))).await;
                // loop back around to reconnect
            }
        }
    }
}

/// Attempt connect-with-timeout repeatedly using `backoff` until it
/// succeeds or cancellation is observed. Returns `None` only on
/// cancellation.
async fn connect_with_backoff(
    config: &TransportConfig,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Option<TcpStream> {
    loop {
        let attempt = tokio::time::timeout(
            config.timeout,
            TcpStream::connect((config.address.as_str(), config.port)),
        );

        tokio::select! {
            _ = cancel.cancelled() => return None,
            result = attempt => {
                match result {
                    Ok(Ok(stream)) => return Some(stream),
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, address = %config.address, port = config.port, "connect failed");
                    }
                    Err(_) => {
                        tracing::warn!(address = %config.address, port = config.port, "connect timed out");
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = backoff.wait() => {}
        }
    }
}

enum ConnectionOutcome {
    PlannedClose,
    Lost(String),
}

async fn serve_connection(
    stream: TcpStream,
    bus: &SharedBus,
    write_rx: &mut mpsc::Receiver<Vec<u8>>,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> ConnectionOutcome {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut received_first_frame = false;

    loop {
        if let Some(frame) = try_extract_frame(&mut buf) {
            if !received_first_frame {
                received_first_frame = true;
                backoff.reset();
            }
            bus.emit(Event::DataReceived(frame)).await;
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => return ConnectionOutcome::PlannedClose,
            write = write_rx.recv() => {
                match write {
                    Some(frame) => {
                        if let Err(err) = writer.write_all(&frame).await {
                            return ConnectionOutcome::Lost(err.to_string());
                        }
                    }
                    None => return ConnectionOutcome::PlannedClose,
                }
            }
            read = read_more(&mut reader, &mut buf) => {
                if let Err(err) = read {
                    return ConnectionOutcome::Lost(err.to_string());
                }
            }
        }
    }
}

async fn read_more(reader: &mut tokio::net::tcp::OwnedReadHalf, buf: &mut BytesMut) -> std::io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    let n = reader.read(&mut chunk).await?;
    if n == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed connection"));
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

/// Pull one complete frame out of `buf` if enough bytes are buffered,
/// advancing `buf` past it. The frame's total length is derived from the
/// header's `payload_length` field (bytes 12..16) — this function only
/// needs the length, not the frame's meaning.
fn try_extract_frame(buf: &mut BytesMut) -> Option<Vec<u8>> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let payload_length = u32::from_be_bytes(buf[12..16].try_into().unwrap()) as usize;
    let total = HEADER_LEN + payload_length;
    if buf.len() < total {
        return None;
    }
    let frame = buf[..total].to_vec();
    buf.advance(total);
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_extract_frame_waits_for_a_complete_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8; 10]);
        assert!(try_extract_frame(&mut buf).is_none());
    }

    #[test]
    fn try_extract_frame_splits_exactly_one_frame_and_leaves_the_rest() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&crate::codec::PREFIX.to_be_bytes());
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.extend_from_slice(&9u32.to_be_bytes());
        frame.extend_from_slice(&8u32.to_be_bytes()); // payload_length
        frame.extend_from_slice(&[0u8; 8]); // payload body

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame);
        buf.extend_from_slice(b"trailing");

        let extracted = try_extract_frame(&mut buf).unwrap();
        assert_eq!(extracted, frame);
        assert_eq!(&buf[..], b"trailing");
    }

    #[tokio::test]
    async fn close_stops_the_run_loop_even_mid_backoff() {
        let bus: SharedBus = std::sync::Arc::new(crate::bus::EventBus::new());
        let transport = Transport::start(
            bus,
            TransportConfig {
                address: "127.0.0.1".into(),
                port: 1, // nothing listens here; connect loop just backs off
                timeout: Duration::from_millis(20),
                backoff: Backoff::new([0.0]),
            },
        );
        tokio::time::timeout(Duration::from_secs(1), transport.close())
            .await
            .expect("close should not hang");
    }
}
