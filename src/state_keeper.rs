//! Periodic full-state refresh and delta reconciliation
//!
//! Grounded on `local_tuya/protocol/state.py`'s `State(PeriodicTask)`: a
//! periodic `Command::State` (DP_QUERY, frame code 10) request folded
//! together with a standing merge of unsolicited `Status` deltas, so callers
//! always see the freshest known snapshot regardless of which path produced
//! it.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventKind, SharedBus};
use crate::codec::{Command, FrameKind, Response};
use crate::sender::Sender;
use crate::value::{self, Values};

enum Msg {
    Connected,
    Closed,
    Response(Response),
}

pub struct StateKeeper {
    task: JoinHandle<()>,
    snapshot_rx: watch::Receiver<Option<Values>>,
}

impl StateKeeper {
    pub fn start(bus: SharedBus, sender: Sender, interval: Duration, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(None);

        let forward = tx.clone();
        bus.register(
            EventKind::ConnectionEstablished,
            std::sync::Arc::new(move |_| {
                let forward = forward.clone();
                Box::pin(async move {
                    let _ = forward.send(Msg::Connected).await;
                    Ok(())
                })
            }),
        );

        let forward = tx.clone();
        bus.register(
            EventKind::ConnectionClosed,
            std::sync::Arc::new(move |_| {
                let forward = forward.clone();
                Box::pin(async move {
                    let _ = forward.send(Msg::Closed).await;
                    Ok(())
                })
            }),
        );

        let forward = tx.clone();
        bus.register(
            EventKind::ResponseReceived,
            std::sync::Arc::new(move |event| {
                let forward = forward.clone();
                Box::pin(async move {
                    if let Event::ResponseReceived(_, response) = event {
                        let _ = forward.send(Msg::Response(response)).await;
                    }
                    Ok(())
                })
            }),
        );

        let task = tokio::spawn(run(bus, sender, interval, rx, cancel, snapshot_tx));
        Self { task, snapshot_rx }
    }

    /// The last observed complete-or-merged snapshot, if any has arrived yet.
    pub fn snapshot(&self) -> Option<Values> {
        self.snapshot_rx.borrow().clone()
    }

    /// A read-only handle other components (UpdateBuffer, publishers) can
    /// poll or await changes on without routing through the bus.
    pub fn watch(&self) -> watch::Receiver<Option<Values>> {
        self.snapshot_rx.clone()
    }

    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn run(
    bus: SharedBus,
    sender: Sender,
    interval: Duration,
    mut rx: mpsc::Receiver<Msg>,
    cancel: CancellationToken,
    snapshot_tx: watch::Sender<Option<Values>>,
) {
    let mut connected = false;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = rx.recv() => {
                match msg {
                    Some(Msg::Connected) => {
                        connected = true;
                        ticker.reset();
                    }
                    Some(Msg::Closed) => connected = false,
                    Some(Msg::Response(response)) => {
                        handle_response(&bus, &snapshot_tx, response).await;
                    }
                    None => return,
                }
            }
            _ = ticker.tick(), if connected => {
                if let Err(err) = sender.send(Command::State).await {
                    tracing::warn!(error = %err, "state refresh timed out or failed, continuing");
                }
            }
        }
    }
}

async fn handle_response(bus: &SharedBus, snapshot_tx: &watch::Sender<Option<Values>>, response: Response) {
    if response.error.is_some() {
        return; // Sender already reported this to its own waiter, if any.
    }

    match response.kind {
        FrameKind::State => {
            let Some(values) = response.values else {
                return;
            };
            if values.is_empty() {
                return; // a full-state response with no dps carries no state
            }
            let _ = snapshot_tx.send(Some(values.clone()));
            bus.emit(Event::StateUpdated(values)).await;
        }
        FrameKind::Status => {
            let Some(delta) = response.values else {
                return;
            };
            let current = snapshot_tx.borrow().clone();
            let Some(current) = current else {
                return; // discard deltas before the first full state
            };
            let merged = value::merge(&current, &delta);
            if merged != current {
                let _ = snapshot_tx.send(Some(merged.clone()));
                bus.emit(Event::StateUpdated(merged)).await;
            }
        }
        FrameKind::Update | FrameKind::Heartbeat => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::value::Value;
    use std::sync::Arc;

    fn values(pairs: &[(&str, i64)]) -> Values {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::Int(*v))).collect()
    }

    #[tokio::test]
    async fn status_before_state_is_discarded() {
        let bus: SharedBus = Arc::new(EventBus::new());
        let sender = Sender::start(bus.clone(), *b"9efe59a10acd6ccf", Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let keeper = StateKeeper::start(bus.clone(), sender, Duration::from_secs(3600), cancel.clone());

        bus.emit(Event::ResponseReceived(
            1,
            Response {
                kind: FrameKind::Status,
                values: Some(values(&[("2", 3)])),
                error: None,
            },
        ))
        .await;
        tokio::task::yield_now().await;

        assert_eq!(keeper.snapshot(), None);
        cancel.cancel();
    }

    #[tokio::test]
    async fn state_then_status_merges() {
        let bus: SharedBus = Arc::new(EventBus::new());
        let sender = Sender::start(bus.clone(), *b"9efe59a10acd6ccf", Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let keeper = StateKeeper::start(bus.clone(), sender, Duration::from_secs(3600), cancel.clone());

        bus.emit(Event::ResponseReceived(
            1,
            Response {
                kind: FrameKind::State,
                values: Some(values(&[("1", 1), ("2", 2)])),
                error: None,
            },
        ))
        .await;
        tokio::task::yield_now().await;
        assert_eq!(keeper.snapshot(), Some(values(&[("1", 1), ("2", 2)])));

        bus.emit(Event::ResponseReceived(
            2,
            Response {
                kind: FrameKind::Status,
                values: Some(values(&[("2", 3)])),
                error: None,
            },
        ))
        .await;
        tokio::task::yield_now().await;
        assert_eq!(keeper.snapshot(), Some(values(&[("1", 1), ("2", 3)])));

        cancel.cancel();
    }
}
