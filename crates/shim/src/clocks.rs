//! Monotonic and wall clocks.

use preview_shim_io::{Pollable, Resource, ResourceTable, Subscribe, subscribe};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// A monotonic clock reporting nanoseconds since an arbitrary epoch.
pub trait HostMonotonicClock: Send {
    fn resolution(&self) -> u64;
    fn now(&self) -> u64;
}

/// A wall clock reporting time since the Unix epoch.
pub trait HostWallClock: Send {
    fn resolution(&self) -> Duration;
    fn now(&self) -> Duration;
}

/// The host's monotonic clock, with the epoch at its creation.
pub struct MonotonicClock {
    initial: std::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            initial: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMonotonicClock for MonotonicClock {
    fn resolution(&self) -> u64 {
        1
    }

    fn now(&self) -> u64 {
        // Saturate instead of wrapping: that takes about 584 years of uptime.
        self.initial
            .elapsed()
            .as_nanos()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// The host's wall clock.
#[derive(Default)]
pub struct WallClock;

impl HostWallClock for WallClock {
    fn resolution(&self) -> Duration {
        Duration::from_nanos(1)
    }

    fn now(&self) -> Duration {
        // A clock set before 1970 reads as the epoch itself.
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// The `wasi:clocks/wall-clock.datetime` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Datetime {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl From<Duration> for Datetime {
    fn from(d: Duration) -> Self {
        Datetime {
            seconds: d.as_secs(),
            nanoseconds: d.subsec_nanos(),
        }
    }
}

/// A point in time a pollable waits for.
pub(crate) enum Deadline {
    Past,
    Instant(Instant),
    Never,
}

#[async_trait::async_trait]
impl Subscribe for Deadline {
    async fn ready(&mut self) {
        match self {
            Deadline::Past => {}
            Deadline::Instant(instant) => tokio::time::sleep_until(*instant).await,
            Deadline::Never => std::future::pending().await,
        }
    }
}

/// Creates a pollable which becomes ready once `duration` has elapsed.
///
/// A zero duration is ready immediately. One too large to represent never
/// becomes ready.
pub fn subscribe_duration(
    table: &mut ResourceTable,
    duration: Duration,
) -> anyhow::Result<Resource<Pollable>> {
    let deadline = if duration.is_zero() {
        Deadline::Past
    } else if let Some(deadline) = Instant::now().checked_add(duration) {
        Deadline::Instant(deadline)
    } else {
        Deadline::Never
    };
    let deadline = table.push(deadline)?;
    subscribe(table, deadline)
}

/// Creates a pollable which becomes ready once `clock` reaches `when`.
pub fn subscribe_instant(
    table: &mut ResourceTable,
    clock: &dyn HostMonotonicClock,
    when: u64,
) -> anyhow::Result<Resource<Pollable>> {
    let now = clock.now();
    let duration = Duration::from_nanos(when.saturating_sub(now));
    subscribe_duration(table, duration)
}

#[cfg(test)]
mod test {
    use super::*;
    use preview_shim_io::poll;

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(1));
        assert!(clock.now() > a);
        assert_eq!(clock.resolution(), 1);
    }

    #[test]
    fn datetime_from_duration() {
        let dt = Datetime::from(Duration::new(5, 42));
        assert_eq!(
            dt,
            Datetime {
                seconds: 5,
                nanoseconds: 42
            }
        );
        assert!(Datetime::from(WallClock.now()).seconds > 1_600_000_000);
    }

    #[test_log::test(tokio::test)]
    async fn deadlines() {
        let mut table = ResourceTable::new();
        let clock = MonotonicClock::new();

        let past = subscribe_instant(&mut table, &clock, 0).unwrap();
        assert!(poll::ready(&mut table, &past).unwrap());

        let never = subscribe_duration(&mut table, Duration::MAX).unwrap();
        assert!(!poll::ready(&mut table, &never).unwrap());

        let soon = subscribe_duration(&mut table, Duration::from_millis(5)).unwrap();
        assert!(!poll::ready(&mut table, &soon).unwrap());
        poll::block(&mut table, &soon).await.unwrap();
        assert!(poll::ready(&mut table, &soon).unwrap());

        assert_eq!(
            poll::poll_list(&mut table, &[never.borrowed(), past.borrowed()])
                .await
                .unwrap(),
            vec![1]
        );
    }
}
