//! Debounce, constraint-filter, single-flight send, and confirm-by-
//! observation retry for user-issued updates
//!
//! Grounded on `local_tuya/device/buffer.py`'s `UpdateBuffer` (debounce via
//! `asyncio.sleep` plus a cancellable background task, single-flight via
//! `asyncio.Lock`, waiter via `asyncio.Future`) and
//! `local_tuya/device/constraints.py`'s `Constraints.filter_values`. Retries
//! are bounded: each attempt re-filters the originally-sent buffer against
//! the freshest snapshot rather than the live (by-then-empty) debounce
//! buffer.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::codec::Command;
use crate::constraints::Constraints;
use crate::sender::{Sender, SenderError};
use crate::value::{self, Values};

#[derive(Debug)]
pub enum UpdateError {
    Cancelled,
    Send(SenderError),
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::Cancelled => write!(f, "update cancelled"),
            UpdateError::Send(err) => write!(f, "update send failed: {err}"),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<SenderError> for UpdateError {
    fn from(err: SenderError) -> Self {
        UpdateError::Send(err)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateBufferConfig {
    pub debounce: Duration,
    pub retries: u32,
    pub retry_backoff: Backoff,
}

type Waiter = oneshot::Sender<Result<(), UpdateError>>;

enum Msg {
    Update(Values, Waiter),
}

pub struct UpdateBuffer {
    tx: mpsc::Sender<Msg>,
    task: JoinHandle<()>,
}

impl UpdateBuffer {
    pub fn start(
        sender: Sender,
        state: watch::Receiver<Option<Values>>,
        constraints: Constraints,
        config: UpdateBufferConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(run(sender, state, constraints, config, rx, cancel));
        Self { tx, task }
    }

    /// Request an update. Resolves once the current debounce/send/confirm
    /// cycle this update became part of finishes.
    pub async fn update(&self, values: Values) -> Result<(), UpdateError> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(Msg::Update(values, respond_to))
            .await
            .map_err(|_| UpdateError::Cancelled)?;
        response.await.map_err(|_| UpdateError::Cancelled)?
    }

    pub async fn stop(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

fn complete_all(waiters: &mut Vec<Waiter>, result: Result<(), UpdateError>) {
    for waiter in waiters.drain(..) {
        let _ = waiter.send(match &result {
            Ok(()) => Ok(()),
            Err(UpdateError::Cancelled) => Err(UpdateError::Cancelled),
            Err(UpdateError::Send(err)) => Err(UpdateError::Send(clone_sender_error(err))),
        });
    }
}

fn clone_sender_error(err: &SenderError) -> SenderError {
    match err {
        SenderError::Timeout => SenderError::Timeout,
        SenderError::ConnectionLost => SenderError::ConnectionLost,
        SenderError::Response(msg) => SenderError::Response(msg.clone()),
        SenderError::Encode(msg) => SenderError::Encode(msg.clone()),
        SenderError::Closed => SenderError::Closed,
    }
}

/// Merge `incoming` into `buffer`, drop keys already at the observed value,
/// and apply constraint filtering against the merged current+pending view.
fn fold_update(buffer: &Values, incoming: &Values, current: &Values, constraints: &Constraints) -> Values {
    let mut merged = value::merge(buffer, incoming);
    merged.retain(|k, v| current.get(k) != Some(v));
    if constraints.is_empty() {
        return merged;
    }
    let context = value::merge(current, &merged);
    constraints.filter(&merged, &context)
}

async fn run(
    sender: Sender,
    mut state: watch::Receiver<Option<Values>>,
    constraints: Constraints,
    config: UpdateBufferConfig,
    mut rx: mpsc::Receiver<Msg>,
    cancel: CancellationToken,
) {
    let mut buffer: Values = Values::new();
    let mut waiters: Vec<Waiter> = Vec::new();

    'outer: loop {
        let (values, waiter) = tokio::select! {
            _ = cancel.cancelled() => { complete_all(&mut waiters, Err(UpdateError::Cancelled)); return; }
            msg = rx.recv() => match msg {
                Some(Msg::Update(v, w)) => (v, w),
                None => { complete_all(&mut waiters, Err(UpdateError::Cancelled)); return; }
            }
        };
        waiters.push(waiter);

        if state.borrow().is_none() {
            tokio::select! {
                _ = cancel.cancelled() => { complete_all(&mut waiters, Err(UpdateError::Cancelled)); return; }
                changed = state.changed() => {
                    if changed.is_err() {
                        complete_all(&mut waiters, Err(UpdateError::Cancelled));
                        return;
                    }
                }
            }
        }
        let current = state.borrow().clone().unwrap_or_default();
        buffer = fold_update(&buffer, &values, &current, &constraints);

        if buffer.is_empty() {
            complete_all(&mut waiters, Ok(()));
            continue 'outer;
        }

        if !config.debounce.is_zero() {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => { complete_all(&mut waiters, Err(UpdateError::Cancelled)); return; }
                    _ = tokio::time::sleep(config.debounce) => break,
                    msg = rx.recv() => {
                        match msg {
                            Some(Msg::Update(v, w)) => {
                                waiters.push(w);
                                let current = state.borrow().clone().unwrap_or_default();
                                buffer = fold_update(&buffer, &v, &current, &constraints);
                                if buffer.is_empty() {
                                    complete_all(&mut waiters, Ok(()));
                                    continue 'outer;
                                }
                                // loop back around: a fresh sleep restarts the debounce window.
                            }
                            None => { complete_all(&mut waiters, Err(UpdateError::Cancelled)); return; }
                        }
                    }
                }
            }
        }

        // SENDING (single-flight): any update() calls arriving from here on
        // queue in `rx` and are only folded in on the next 'outer iteration.
        let sent_buffer = std::mem::take(&mut buffer);
        match sender.send(Command::Update(sent_buffer.clone())).await {
            Err(err) => {
                complete_all(&mut waiters, Err(err.into()));
                continue 'outer;
            }
            Ok(()) => {}
        }

        if config.retries > 0 {
            let cancelled = confirm_with_retries(&sender, &mut state, &config, sent_buffer, &cancel).await;
            if cancelled {
                complete_all(&mut waiters, Err(UpdateError::Cancelled));
                return;
            }
        }

        complete_all(&mut waiters, Ok(()));
    }
}

/// Returns `true` if cancellation interrupted the retry loop, `false` if it
/// ran to confirmation or exhaustion.
async fn confirm_with_retries(
    sender: &Sender,
    state: &mut watch::Receiver<Option<Values>>,
    config: &UpdateBufferConfig,
    sent_buffer: Values,
    cancel: &CancellationToken,
) -> bool {
    let mut remaining = sent_buffer;
    let mut backoff = config.retry_backoff.clone();

    for attempt in 0..config.retries {
        tokio::select! {
            _ = cancel.cancelled() => return true,
            _ = backoff.wait() => {}
        }

        let current = state.borrow().clone().unwrap_or_default();
        remaining.retain(|k, v| current.get(k) != Some(v));
        if remaining.is_empty() {
            return false;
        }

        if let Err(err) = sender.send(Command::Update(remaining.clone())).await {
            tracing::warn!(error = %err, attempt, "update retry resend failed, will try again");
        }
    }

    if !remaining.is_empty() {
        tracing::error!(remaining = ?remaining, retries = config.retries, "update not confirmed by device after all retries");
    }
    false
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

    fn no_retry_config() -> UpdateBufferConfig {
        UpdateBufferConfig {
            debounce: Duration::from_millis(5),
            retries: 0,
            retry_backoff: Backoff::new([0.0]),
        }
    }

    #[tokio::test]
    async fn no_op_update_resolves_without_sending() {
        let bus: SharedBusAlias = Arc::new(EventBus::new());
        let sender = Sender::start(bus.clone(), *b"9efe59a10acd6ccf", Duration::from_secs(1));
        let (state_tx, state_rx) = watch::channel(Some(values(&[("1", 1)])));
        let cancel = CancellationToken::new();

        let sent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sent_clone = sent.clone();
        bus.register(
            crate::bus::EventKind::CommandSent,
            Arc::new(move |event| {
                if let crate::bus::Event::CommandSent(Command::Update(_)) = event {
                    sent_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
                Box::pin(async { Ok(()) })
            }),
        );

        let buffer = UpdateBuffer::start(sender, state_rx, Constraints::default(), no_retry_config(), cancel.clone());
        buffer.update(values(&[("1", 1)])).await.unwrap();

        assert_eq!(sent.load(std::sync::atomic::Ordering::SeqCst), 0);
        drop(state_tx);
        cancel.cancel();
    }

    #[tokio::test]
    async fn debounced_updates_merge_into_a_single_send() {
        let bus: SharedBusAlias = Arc::new(EventBus::new());
        let sender = Sender::start(bus.clone(), *b"9efe59a10acd6ccf", Duration::from_secs(1));
        let (state_tx, state_rx) = watch::channel(Some(values(&[("1", 1), ("2", 2)])));
        let cancel = CancellationToken::new();

        let sent: Arc<std::sync::Mutex<Vec<Values>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sent_clone = sent.clone();
        bus.register(
            crate::bus::EventKind::CommandSent,
            Arc::new(move |event| {
                if let crate::bus::Event::CommandSent(Command::Update(values)) = event {
                    sent_clone.lock().unwrap().push(values);
                }
                Box::pin(async { Ok(()) })
            }),
        );
        // Swallow DataSent/connection requirements: respond immediately so
        // Sender's per-send task does not hang waiting on `connected`.
        bus.emit(crate::bus::Event::ConnectionEstablished).await;
        let bus_for_echo = bus.clone();
        bus.register(
            crate::bus::EventKind::DataSent,
            Arc::new(move |event| {
                let bus_for_echo = bus_for_echo.clone();
                Box::pin(async move {
                    if let crate::bus::Event::DataSent(frame) = event {
                        let codec = crate::codec::Codec::new(*b"9efe59a10acd6ccf");
                        let (seq, _) = codec.unpack(&frame).unwrap();
                        let response = codec.pack(seq, &Command::Update(Values::new())).unwrap();
                        bus_for_echo.emit(crate::bus::Event::DataReceived(response)).await;
                    }
                    Ok(())
                })
            }),
        );

        let buffer = UpdateBuffer::start(
            sender,
            state_rx,
            Constraints::default(),
            UpdateBufferConfig {
                debounce: Duration::from_millis(20),
                retries: 0,
                retry_backoff: Backoff::new([0.0]),
            },
            cancel.clone(),
        );

        let a = buffer.update(values(&[("1", 2)]));
        let b = buffer.update(values(&[("2", 3)]));
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();

        let sends = sent.lock().unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].get("1"), Some(&Value::Int(2)));
        assert_eq!(sends[0].get("2"), Some(&Value::Int(3)));

        drop(state_tx);
        cancel.cancel();
    }

    type SharedBusAlias = crate::bus::SharedBus;
}
