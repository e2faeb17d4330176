//! Election and Heartbeat Scheduler
//!
//! Randomized election timeouts and the fixed leader heartbeat. The
//! scheduler only keeps deadlines; it yields [`TimerEvent`]s and never
//! touches consensus state.

use std::time::Duration;
use rand::Rng;
use tokio::time::{sleep_until, Instant};

use crate::config::RaftdConfig;

/// Something the clock decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// No leader heard from in time
    ElectionTimeout,
    /// Time for the leader to contact followers
    Heartbeat,
}

/// Timer settings
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Minimum election timeout in milliseconds
    pub election_timeout_min_ms: u64,
    /// Maximum election timeout in milliseconds
    pub election_timeout_max_ms: u64,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
}

impl TimerConfig {
    pub fn from_config(config: &RaftdConfig) -> Self {
        Self {
            election_timeout_min_ms: config.cluster.election_timeout_min_ms,
            election_timeout_max_ms: config.cluster.election_timeout_max_ms,
            heartbeat_interval_ms: config.cluster.heartbeat_interval_ms,
        }
    }
}

/// Election and heartbeat deadlines
pub struct Scheduler {
    config: TimerConfig,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
}

impl Scheduler {
    /// Create a scheduler with a freshly armed election timer
    pub fn new(config: TimerConfig) -> Self {
        let now = Instant::now();
        let election_deadline = now + random_timeout(&config);
        let heartbeat_deadline = now + Duration::from_millis(config.heartbeat_interval_ms);
        Self {
            config,
            election_deadline,
            heartbeat_deadline,
        }
    }

    /// Push the election deadline out by a new random timeout
    pub fn reset_election(&mut self) {
        self.election_deadline = Instant::now() + random_timeout(&self.config);
    }

    /// Restart the heartbeat cadence from now (on becoming leader)
    pub fn start_heartbeats(&mut self) {
        self.heartbeat_deadline = Instant::now() + self.heartbeat_interval();
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_interval_ms)
    }

    /// Wait for the next event
    ///
    /// Leaders only get heartbeats, everyone else only election
    /// timeouts. Safe to cancel: deadlines change only after the sleep
    /// completes.
    pub async fn next_event(&mut self, leader: bool) -> TimerEvent {
        if leader {
            sleep_until(self.heartbeat_deadline).await;
            self.heartbeat_deadline = Instant::now() + self.heartbeat_interval();
            TimerEvent::Heartbeat
        } else {
            sleep_until(self.election_deadline).await;
            self.reset_election();
            TimerEvent::ElectionTimeout
        }
    }
}

/// Generate a random election timeout
fn random_timeout(config: &TimerConfig) -> Duration {
    let mut rng = rand::thread_rng();
    let max = config.election_timeout_max_ms.max(config.election_timeout_min_ms);
    let ms = rng.gen_range(config.election_timeout_min_ms..=max);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> TimerConfig {
        TimerConfig {
            election_timeout_min_ms: 30,
            election_timeout_max_ms: 60,
            heartbeat_interval_ms: 10,
        }
    }

    #[test]
    fn test_random_timeout_in_range() {
        let config = fast();
        for _ in 0..100 {
            let t = random_timeout(&config);
            assert!(t >= Duration::from_millis(30) && t <= Duration::from_millis(60));
        }
    }

    #[tokio::test]
    async fn test_follower_gets_election_timeout() {
        let started = Instant::now();
        let mut scheduler = Scheduler::new(fast());

        let event = scheduler.next_event(false).await;
        assert_eq!(event, TimerEvent::ElectionTimeout);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_leader_gets_heartbeats() {
        let mut scheduler = Scheduler::new(fast());
        scheduler.start_heartbeats();

        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_millis(100), scheduler.next_event(true))
                .await
                .unwrap();
            assert_eq!(event, TimerEvent::Heartbeat);
        }
    }

    #[tokio::test]
    async fn test_reset_postpones_election() {
        let mut scheduler = Scheduler::new(fast());
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.reset_election();

        let early = tokio::time::timeout(Duration::from_millis(25), scheduler.next_event(false)).await;
        assert!(early.is_err());
    }
}
