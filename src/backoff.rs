//! Reusable wait sequence with reset, shared by Transport and the MQTT
//! adapter.
//!
//! Grounded on `local_tuya/backoff.py`'s `SequenceBackoff`: an index into a
//! fixed sequence of delays that saturates at the last element and resets to
//! zero.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    sequence: Vec<Duration>,
    index: usize,
}

impl Backoff {
    pub fn new(sequence_secs: impl IntoIterator<Item = f64>) -> Self {
        let sequence: Vec<Duration> = sequence_secs
            .into_iter()
            .map(Duration::from_secs_f64)
            .collect();
        assert!(!sequence.is_empty(), "backoff sequence must not be empty");
        Self { sequence, index: 0 }
    }

    /// Sleep for the current delay, then advance to the next one unless
    /// already at the end of the sequence.
    pub async fn wait(&mut self) {
        let delay = self.sequence[self.index];
        if self.index < self.sequence.len() - 1 {
            self.index += 1;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Reset to the start of the sequence. Should be called on evidence the
    /// peer is actually healthy (e.g. a successful response), not merely on
    /// a TCP connect.
    pub fn reset(&mut self) {
        self.index = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new([0.0, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn saturates_at_last_element() {
        let mut backoff = Backoff::new([0.0, 0.0, 0.0]);
        for _ in 0..10 {
            backoff.wait().await;
        }
        assert_eq!(backoff.index, 2);
    }

    #[tokio::test]
    async fn reset_goes_back_to_start() {
        let mut backoff = Backoff::new([0.0, 0.0]);
        backoff.wait().await;
        assert_eq!(backoff.index, 1);
        backoff.reset();
        assert_eq!(backoff.index, 0);
    }

    #[tokio::test]
    async fn zero_delay_does_not_block() {
        let mut backoff = Backoff::new([0.0]);
        let start = Instant::now();
        backoff.wait().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
