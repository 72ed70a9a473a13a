//! Sequence-number allocation and request/response correlation
//!
//! Grounded on `local_tuya/protocol/sender.py`'s `Sender`, translated from
//! its one-task-per-pending-command model to a single actor task owning a
//! `HashMap<(u32, CommandKind), _>` Pending table, with a short-lived helper
//! task per send that waits for the connection and enforces the timeout —
//! so the actor loop itself never blocks waiting to become connected, which
//! would otherwise deadlock against the very `ConnectionEstablished` event
//! that would unblock it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::bus::{Event, EventKind, SharedBus};
use crate::codec::{Codec, Command, CommandKind, Response};

#[derive(Debug)]
pub enum SenderError {
    Timeout,
    ConnectionLost,
    Response(String),
    Encode(String),
    /// The actor task is gone (session torn down concurrently).
    Closed,
}

impl fmt::Display for SenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderError::Timeout => write!(f, "command timed out"),
            SenderError::ConnectionLost => write!(f, "connection lost"),
            SenderError::Response(msg) => write!(f, "device returned an error: {msg}"),
            SenderError::Encode(msg) => write!(f, "encode error: {msg}"),
            SenderError::Closed => write!(f, "sender is closed"),
        }
    }
}

impl std::error::Error for SenderError {}

enum ActorMsg {
    Send(Command, oneshot::Sender<Result<(), SenderError>>),
    DataReceived(Vec<u8>),
    ConnectionEstablished,
    ConnectionClosed,
    /// A per-send helper task's timeout fired; drop the stale Pending entry
    /// if it's still there (it may already have been resolved).
    Expire(u32, CommandKind),
}

struct Pending {
    respond_to: oneshot::Sender<Result<(), SenderError>>,
}

#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<ActorMsg>,
}

impl Sender {
    /// Registers this sender's bus listeners and spawns its actor task.
    pub fn start(bus: SharedBus, key: [u8; 16], timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(256);

        let forward = tx.clone();
        bus.register(
            EventKind::ConnectionEstablished,
            std::sync::Arc::new(move |_| {
                let forward = forward.clone();
                Box::pin(async move {
                    forward
                        .send(ActorMsg::ConnectionEstablished)
                        .await
                        .map_err(|_| -> Box<dyn std::error::Error + Send + Sync> { "sender actor gone".into() })
                })
            }),
        );

        let forward = tx.clone();
        bus.register(
            EventKind::ConnectionClosed,
            std::sync::Arc::new(move |_| {
                let forward = forward.clone();
                Box::pin(async move {
                    forward
                        .send(ActorMsg::ConnectionClosed)
                        .await
                        .map_err(|_| -> Box<dyn std::error::Error + Send + Sync> { "sender actor gone".into() })
                })
            }),
        );

        let forward = tx.clone();
        bus.register(
            EventKind::DataReceived,
            std::sync::Arc::new(move |event| {
                let forward = forward.clone();
                Box::pin(async move {
                    if let Event::DataReceived(frame) = event {
                        forward
                            .send(ActorMsg::DataReceived(frame))
                            .await
                            .map_err(|_| -> Box<dyn std::error::Error + Send + Sync> { "sender actor gone".into() })?;
                    }
                    Ok(())
                })
            }),
        );

        tokio::spawn(run_actor(rx, tx.clone(), bus, Codec::new(key), timeout));

        Self { tx }
    }

    /// Send a command and await its correlated response, subject to the
    /// sender's configured timeout.
    pub async fn send(&self, command: Command) -> Result<(), SenderError> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(ActorMsg::Send(command, respond_to))
            .await
            .map_err(|_| SenderError::Closed)?;
        response.await.map_err(|_| SenderError::Closed)?
    }
}

async fn run_actor(
    mut rx: mpsc::Receiver<ActorMsg>,
    self_tx: mpsc::Sender<ActorMsg>,
    bus: SharedBus,
    codec: Codec,
    timeout: Duration,
) {
    let mut pending: HashMap<(u32, CommandKind), Pending> = HashMap::new();
    let mut next_seq: u32 = 0;
    let (connected_tx, connected_rx) = watch::channel(false);

    while let Some(msg) = rx.recv().await {
        match msg {
            ActorMsg::ConnectionEstablished => {
                let _ = connected_tx.send(true);
            }
            ActorMsg::ConnectionClosed => {
                let _ = connected_tx.send(false);
                for (_, entry) in pending.drain() {
                    let _ = entry.respond_to.send(Err(SenderError::ConnectionLost));
                }
            }
            ActorMsg::Expire(seq, kind) => {
                pending.remove(&(seq, kind));
            }
            ActorMsg::DataReceived(frame) => {
                let (seq, response) = match codec.unpack(&frame) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping undecodable frame");
                        continue;
                    }
                };
                handle_response(&mut pending, &bus, seq, response).await;
            }
            ActorMsg::Send(command, respond_to) => {
                let kind = command.kind();
                let seq = allocate_seq(kind, &mut next_seq);

                let frame = match codec.pack(seq, &command) {
                    Ok(frame) => frame,
                    Err(err) => {
                        let _ = respond_to.send(Err(SenderError::Encode(err.to_string())));
                        continue;
                    }
                };

                let (internal_tx, internal_rx) = oneshot::channel();
                pending.insert(
                    (seq, kind),
                    Pending {
                        respond_to: internal_tx,
                    },
                );

                bus.emit(Event::CommandSent(command)).await;

                tokio::spawn(drive_send(
                    bus.clone(),
                    self_tx.clone(),
                    connected_rx.clone(),
                    frame,
                    seq,
                    kind,
                    timeout,
                    internal_rx,
                    respond_to,
                ));
            }
        }
    }
}

async fn handle_response(
    pending: &mut HashMap<(u32, CommandKind), Pending>,
    bus: &SharedBus,
    seq: u32,
    response: Response,
) {
    bus.emit(Event::ResponseReceived(seq, response.clone())).await;

    let Some(kind) = response.kind.command_kind() else {
        return; // Status frames are never solicited; nothing to correlate.
    };

    if let Some(entry) = pending.remove(&(seq, kind)) {
        let result = match response.error {
            Some(err) => Err(SenderError::Response(err.0)),
            None => Ok(()),
        };
        let _ = entry.respond_to.send(result);
    }
}

/// Waits for the connection, emits `DataSent`, then races the correlated
/// response against `timeout`. Never touches `pending` directly — on
/// timeout it asks the actor to expire the entry via `ActorMsg::Expire`.
#[allow(clippy::too_many_arguments)]
async fn drive_send(
    bus: SharedBus,
    self_tx: mpsc::Sender<ActorMsg>,
    mut connected_rx: watch::Receiver<bool>,
    frame: Vec<u8>,
    seq: u32,
    kind: CommandKind,
    timeout: Duration,
    internal_rx: oneshot::Receiver<Result<(), SenderError>>,
    respond_to: oneshot::Sender<Result<(), SenderError>>,
) {
    while !*connected_rx.borrow() {
        if connected_rx.changed().await.is_err() {
            let _ = respond_to.send(Err(SenderError::ConnectionLost));
            return;
        }
    }

    bus.emit(Event::DataSent(frame)).await;

    match tokio::time::timeout(timeout, internal_rx).await {
        Ok(Ok(result)) => {
            let _ = respond_to.send(result);
        }
        Ok(Err(_)) => {
            // Pending was dropped without a reply, e.g. the actor task died.
            let _ = respond_to.send(Err(SenderError::ConnectionLost));
        }
        Err(_) => {
            let _ = respond_to.send(Err(SenderError::Timeout));
            let _ = self_tx.send(ActorMsg::Expire(seq, kind)).await;
        }
    }
}

/// Heartbeats always use sequence 0; everything else cycles 1..=1000.
fn allocate_seq(kind: CommandKind, next_seq: &mut u32) -> u32 {
    if kind == CommandKind::Heartbeat {
        return 0;
    }
    *next_seq = if *next_seq >= 1000 { 1 } else { *next_seq + 1 };
    *next_seq
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::value::Values;
    use std::sync::Arc;

    const TEST_KEY: [u8; 16] = *b"9efe59a10acd6ccf";

    #[test]
    fn sequence_numbers_wrap_from_1000_to_1() {
        let mut next = 999;
        assert_eq!(allocate_seq(CommandKind::State, &mut next), 1000);
        assert_eq!(allocate_seq(CommandKind::State, &mut next), 1);
        assert_eq!(allocate_seq(CommandKind::Heartbeat, &mut next), 0);
        assert_eq!(next, 1); // heartbeat never advances the counter
    }

    #[tokio::test]
    async fn heartbeat_round_trip_resolves_ok() {
        let bus: SharedBus = Arc::new(EventBus::new());
        let sender = Sender::start(bus.clone(), TEST_KEY, Duration::from_millis(200));

        // Emulate Transport: capture the outbound frame, decode it as a
        // device would, and push back a matching response frame.
        let bus_for_echo = bus.clone();
        bus.register(
            EventKind::DataSent,
            Arc::new(move |event| {
                let bus_for_echo = bus_for_echo.clone();
                Box::pin(async move {
                    if let Event::DataSent(frame) = event {
                        let codec = Codec::new(TEST_KEY);
                        let (seq, _) = codec.unpack(&frame).unwrap();
                        let response_frame = codec.pack(seq, &Command::Heartbeat).unwrap();
                        bus_for_echo.emit(Event::DataReceived(response_frame)).await;
                    }
                    Ok(())
                })
            }),
        );

        bus.emit(Event::ConnectionEstablished).await;
        sender.send(Command::Heartbeat).await.unwrap();
    }

    #[tokio::test]
    async fn send_before_connected_waits_then_times_out() {
        let bus: SharedBus = Arc::new(EventBus::new());
        let sender = Sender::start(bus.clone(), TEST_KEY, Duration::from_millis(20));

        let result = sender.send(Command::State).await;
        assert!(matches!(result, Err(SenderError::Timeout)) || matches!(result, Err(SenderError::ConnectionLost)));
    }

    #[tokio::test]
    async fn connection_closed_fails_pending_sends() {
        let bus: SharedBus = Arc::new(EventBus::new());
        let sender = Sender::start(bus.clone(), TEST_KEY, Duration::from_secs(5));

        bus.emit(Event::ConnectionEstablished).await;
        let send_fut = tokio::spawn({
            let sender = sender.clone();
            async move { sender.send(Command::Update(Values::new())).await }
        });

        // Give the spawned send a moment to register its Pending entry.
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.emit(Event::ConnectionClosed(Some("peer reset".into()))).await;

        let result = send_fut.await.unwrap();
        assert!(matches!(result, Err(SenderError::ConnectionLost)));
    }
}
