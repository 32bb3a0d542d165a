//! Local ETA countdown.
//!
//! The board reports the remaining time with every `status` event. Between
//! reports the controller counts down on its own clock, and a report never
//! moves the displayed value up while a session runs.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct EtaCountdown {
    deadline: Option<Instant>,
}

impl EtaCountdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts counting down from `eta`.
    pub fn start(&mut self, eta: Duration) {
        self.deadline = Some(Instant::now() + eta);
    }

    /// Applies a board report; the countdown only ever moves down.
    pub fn resync(&mut self, eta: Duration) {
        let reported = Instant::now() + eta;
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(reported),
            None => reported,
        });
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left, or `None` when no session is running.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_down_and_never_increases() {
        let mut eta = EtaCountdown::new();
        assert_eq!(eta.remaining(), None);

        eta.start(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(eta.remaining(), Some(Duration::from_secs(7)));

        // A late report with a larger value is ignored.
        eta.resync(Duration::from_secs(9));
        assert_eq!(eta.remaining(), Some(Duration::from_secs(7)));

        // A smaller one wins.
        eta.resync(Duration::from_secs(5));
        assert_eq!(eta.remaining(), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(eta.remaining(), Some(Duration::ZERO));

        eta.stop();
        assert!(!eta.is_running());
    }
}
