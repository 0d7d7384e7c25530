//! State timers of one instance.

use csmr_core::{Event, TimerRequest};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Shortest period of a repeating timer.
const MIN_REPEAT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
struct Armed {
    request: TimerRequest,
    deadline: Instant,
}

/// Armed timers keyed by `<state path>/<timer name>`.
///
/// Expired timers raise their event on the internal path. Starting a timer
/// under a key that is already armed restarts it.
#[derive(Debug, Default)]
pub struct TimerSet {
    armed: BTreeMap<String, Armed>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, request: TimerRequest) {
        let deadline = Instant::now() + request.delay;
        tracing::trace!("timer {} armed for {:?}", request.key, request.delay);
        self.armed.insert(request.key.clone(), Armed { request, deadline });
    }

    /// Disarms a timer. Returns false if it was not armed.
    pub fn cancel(&mut self, key: &str) -> bool {
        self.armed.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.armed.clear();
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    pub fn is_armed(&self, key: &str) -> bool {
        self.armed.contains_key(key)
    }

    fn earliest(&self) -> Option<(String, Instant)> {
        self.armed
            .iter()
            .min_by_key(|(_, armed)| armed.deadline)
            .map(|(key, armed)| (key.clone(), armed.deadline))
    }

    /// Waits for the next timer to expire and returns its event.
    ///
    /// Pending while no timer is armed. Cancel safe: nothing changes until
    /// the deadline has passed.
    pub async fn fired(&mut self) -> Event {
        let Some((key, deadline)) = self.earliest() else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(deadline).await;

        let armed = match self.armed.get_mut(&key) {
            Some(armed) if armed.request.repeat => {
                let period = armed.request.delay.max(MIN_REPEAT);
                armed.deadline = deadline + period;
                armed.clone()
            }
            _ => match self.armed.remove(&key) {
                Some(armed) => armed,
                None => return std::future::pending().await,
            },
        };
        tracing::debug!("timer {} fired '{}'", key, armed.request.event);
        Event::internal(armed.request.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_pending;

    fn timer(key: &str, delay_ms: u64, event: &str, repeat: bool) -> TimerRequest {
        TimerRequest {
            key: key.to_string(),
            delay: Duration::from_millis(delay_ms),
            event: event.to_string(),
            repeat,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let mut timers = TimerSet::new();
        timers.start(timer("Waiting/slow", 300, "slow", false));
        timers.start(timer("Waiting/fast", 100, "fast", false));

        assert_eq!(timers.fired().await.name, "fast");
        assert_eq!(timers.fired().await.name, "slow");
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_timer_rearms() {
        let mut timers = TimerSet::new();
        timers.start(timer("Polling/poll", 50, "poll", true));
        let begin = Instant::now();

        for _ in 0..3 {
            assert_eq!(timers.fired().await.name, "poll");
        }
        assert_eq!(begin.elapsed(), Duration::from_millis(150));
        assert!(timers.is_armed("Polling/poll"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_restart() {
        let mut timers = TimerSet::new();
        timers.start(timer("A/t", 100, "first", false));
        assert!(timers.cancel("A/t"));
        assert!(!timers.cancel("A/t"));

        timers.start(timer("A/t", 100, "first", false));
        tokio::time::advance(Duration::from_millis(60)).await;
        timers.start(timer("A/t", 100, "restarted", false));
        let begin = Instant::now();
        assert_eq!(timers.fired().await.name, "restarted");
        assert_eq!(begin.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_without_timers() {
        let mut timers = TimerSet::new();
        let mut fired = tokio_test::task::spawn(timers.fired());
        assert_pending!(fired.poll());
        drop(fired);

        timers.start(timer("A/t", 0, "now", false));
        let event = timers.fired().await;
        assert_eq!(event.name, "now");
        assert_eq!(event.channel, csmr_core::Channel::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_before_deadline() {
        let mut timers = TimerSet::new();
        timers.start(timer("A/t", 100, "late", false));
        {
            let mut fired = tokio_test::task::spawn(timers.fired());
            assert_pending!(fired.poll());
        }
        tokio::time::advance(Duration::from_millis(100)).await;
        let at = Instant::now();
        assert_eq!(timers.fired().await.name, "late");
        assert_eq!(Instant::now(), at);
    }
}
