//! Process-wide timestamp state: a monotonic elapsed-microseconds clock
//! immune to wall-clock adjustment, paired with the current system time,
//! refreshed by a single background thread every ~500 µs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const REFRESH_INTERVAL: Duration = Duration::from_micros(500);
const MIN_PLAUSIBLE_DELTA_US: i64 = 0;
const MAX_PLAUSIBLE_DELTA_US: i64 = 1_000_000;

struct State {
    monotonic_us: AtomicU64,
    wall_us: AtomicU64,
}

fn state() -> &'static State {
    static STATE: OnceLock<State> = OnceLock::new();
    STATE.get_or_init(|| {
        let state = State {
            monotonic_us: AtomicU64::new(0),
            wall_us: AtomicU64::new(wall_clock_us()),
        };
        std::thread::Builder::new()
            .name("lattice-timestamp".to_string())
            .spawn(refresh_loop)
            .expect("failed to spawn timestamp refresh thread");
        state
    })
}

fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn refresh_loop() {
    let start = Instant::now();
    let mut last_elapsed_us: i64 = 0;
    loop {
        std::thread::sleep(REFRESH_INTERVAL);
        let now_elapsed_us = start.elapsed().as_micros() as i64;
        let delta = now_elapsed_us - last_elapsed_us;

        if delta > MIN_PLAUSIBLE_DELTA_US && delta < MAX_PLAUSIBLE_DELTA_US {
            last_elapsed_us = now_elapsed_us;
            state().monotonic_us.store(now_elapsed_us as u64, Ordering::Release);
        } else {
            tracing::warn!(
                target: "lattice_reactor::timestamp",
                delta_us = delta,
                "rejected implausible monotonic clock delta"
            );
        }

        state().wall_us.store(wall_clock_us(), Ordering::Release);
    }
}

/// Microseconds since this process's timestamp thread started, immune to
/// wall-clock adjustment. Updated roughly every 500 µs.
pub fn monotonic_micros() -> u64 {
    state().monotonic_us.load(Ordering::Acquire)
}

/// Milliseconds since this process's timestamp thread started.
pub fn monotonic_millis() -> u64 {
    monotonic_micros() / 1_000
}

/// Current wall-clock time in microseconds since the Unix epoch, as of
/// the last ~500 µs refresh.
pub fn wall_clock_micros() -> u64 {
    state().wall_us.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_advances_over_time() {
        let first = monotonic_micros();
        std::thread::sleep(Duration::from_millis(5));
        let second = monotonic_micros();
        assert!(second >= first);
    }

    #[test]
    fn wall_clock_is_plausible() {
        let wall = wall_clock_micros();
        // Some time after 2020-01-01 in microseconds since epoch.
        assert!(wall > 1_577_836_800_000_000);
    }
}
