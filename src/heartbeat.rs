//! Periodic liveness command while connected
//!
//! A `tokio::time::interval` loop, grounded on `local_tuya/protocol/heartbeat.py`'s
//! `Heartbeat(PeriodicTask)`: it only ticks between `ConnectionEstablished`
//! and `ConnectionClosed` rather than running unconditionally from process
//! start.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventKind, SharedBus};
use crate::codec::Command;
use crate::sender::Sender;

enum ConnState {
    Established,
    Closed,
}

pub struct Heartbeat {
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(bus: SharedBus, sender: Sender, interval: Duration, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(8);

        let forward = tx.clone();
        bus.register(
            EventKind::ConnectionEstablished,
            std::sync::Arc::new(move |_| {
                let forward = forward.clone();
                Box::pin(async move {
                    let _ = forward.send(ConnState::Established).await;
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
                    let _ = forward.send(ConnState::Closed).await;
                    Ok(())
                })
            }),
        );

        let task = tokio::spawn(run(sender, interval, rx, cancel));
        Self { task }
    }

    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn run(sender: Sender, interval: Duration, mut rx: mpsc::Receiver<ConnState>, cancel: CancellationToken) {
    let mut connected = false;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Consume the immediate first tick every `interval` produces so a
    // heartbeat only fires after a full interval of being connected.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = rx.recv() => {
                match msg {
                    Some(ConnState::Established) => {
                        connected = true;
                        ticker.reset();
                    }
                    Some(ConnState::Closed) => connected = false,
                    None => return,
                }
            }
            _ = ticker.tick(), if connected => {
                if let Err(err) = sender.send(Command::Heartbeat).await {
                    tracing::warn!(error = %err, "heartbeat timed out or failed, continuing");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_only_while_connected() {
        let bus: SharedBus = Arc::new(EventBus::new());
        let sender = Sender::start(bus.clone(), *b"9efe59a10acd6ccf", Duration::from_millis(5));
        let cancel = CancellationToken::new();

        let sent = Arc::new(AtomicUsize::new(0));
        let sent_clone = sent.clone();
        bus.register(
            EventKind::CommandSent,
            Arc::new(move |event| {
                if let Event::CommandSent(Command::Heartbeat) = event {
                    sent_clone.fetch_add(1, Ordering::SeqCst);
                }
                Box::pin(async { Ok(()) })
            }),
        );

        let _heartbeat = Heartbeat::start(bus.clone(), sender, Duration::from_millis(10), cancel.clone());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 0, "no ticks before connection");

        bus.emit(Event::ConnectionEstablished).await;
        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;
        assert!(sent.load(Ordering::SeqCst) >= 1);

        cancel.cancel();
    }
}
