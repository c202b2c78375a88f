//! Rolling sleep/run histogram producing an integer load percent.
//!
//! Every poller and worker-pool thread owns one of these. `start_sleep`/
//! `wake_up` bracket the multiplexer wait; `load()` is consulted by the
//! pool's least-loaded selection without per-task accounting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Sample {
    duration: Duration,
    is_sleep: bool,
}

struct State {
    samples: VecDeque<Sample>,
    sleeping: bool,
    last_sleep: Instant,
    last_wake: Instant,
}

/// Bounded FIFO of `(duration, is_sleep)` samples plus last-transition
/// timestamps, trimmed by both sample count and retained time span.
pub struct LoadMeter {
    state: Mutex<State>,
    max_samples: usize,
    max_window: Duration,
}

impl LoadMeter {
    /// A fresh meter starting in the "sleeping" state, retaining at most
    /// `max_samples` transitions or `max_window` of elapsed time.
    pub fn new(max_samples: usize, max_window: Duration) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(State {
                samples: VecDeque::new(),
                sleeping: true,
                last_sleep: now,
                last_wake: now,
            }),
            max_samples,
            max_window,
        }
    }

    /// Record entry into the multiplexer wait (transition out of "running").
    pub fn start_sleep(&self) {
        let mut state = self.state.lock();
        state.sleeping = true;
        let now = Instant::now();
        let run_time = now.saturating_duration_since(state.last_wake);
        state.last_sleep = now;
        push_bounded(&mut state.samples, Sample { duration: run_time, is_sleep: false }, self.max_samples);
    }

    /// Record exit from the multiplexer wait (transition out of "sleeping").
    pub fn wake_up(&self) {
        let mut state = self.state.lock();
        state.sleeping = false;
        let now = Instant::now();
        let sleep_time = now.saturating_duration_since(state.last_sleep);
        state.last_wake = now;
        push_bounded(&mut state.samples, Sample { duration: sleep_time, is_sleep: true }, self.max_samples);
    }

    /// Integer load percent over the retained window: `100 * run / (run + sleep)`,
    /// or 0 if no time has been recorded yet.
    pub fn load(&self) -> u32 {
        let mut state = self.state.lock();

        let mut total_sleep = Duration::ZERO;
        let mut total_run = Duration::ZERO;
        for sample in &state.samples {
            if sample.is_sleep {
                total_sleep += sample.duration;
            } else {
                total_run += sample.duration;
            }
        }

        let now = Instant::now();
        if state.sleeping {
            total_sleep += now.saturating_duration_since(state.last_sleep);
        } else {
            total_run += now.saturating_duration_since(state.last_wake);
        }

        let mut total = total_run + total_sleep;
        while !state.samples.is_empty()
            && (total > self.max_window || state.samples.len() > self.max_samples)
        {
            let sample = state.samples.pop_front().unwrap();
            if sample.is_sleep {
                total_sleep = total_sleep.saturating_sub(sample.duration);
            } else {
                total_run = total_run.saturating_sub(sample.duration);
            }
            total = total.saturating_sub(sample.duration);
        }

        if total.is_zero() {
            return 0;
        }
        ((total_run.as_micros() * 100) / total.as_micros()) as u32
    }
}

fn push_bounded(samples: &mut VecDeque<Sample>, sample: Sample, max_samples: usize) {
    samples.push_back(sample);
    if samples.len() > max_samples {
        samples.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn empty_meter_reports_zero() {
        let meter = LoadMeter::new(32, Duration::from_secs(2));
        assert_eq!(meter.load(), 0);
    }

    #[test]
    fn load_is_bounded_zero_to_hundred() {
        let meter = LoadMeter::new(32, Duration::from_secs(2));
        meter.wake_up();
        sleep(Duration::from_millis(5));
        meter.start_sleep();
        sleep(Duration::from_millis(5));
        meter.wake_up();
        let load = meter.load();
        assert!(load <= 100);
    }

    #[test]
    fn window_trims_by_max_samples() {
        let meter = LoadMeter::new(4, Duration::from_secs(60));
        for _ in 0..20 {
            meter.wake_up();
            meter.start_sleep();
        }
        let state = meter.state.lock();
        assert!(state.samples.len() <= 4);
    }

    #[test]
    fn window_trims_by_max_usec() {
        let meter = LoadMeter::new(1000, Duration::from_micros(1));
        meter.wake_up();
        sleep(Duration::from_millis(2));
        meter.start_sleep();
        sleep(Duration::from_millis(2));
        meter.wake_up();
        // The retained window is capped at 1us of span, so old samples are
        // trimmed away almost immediately.
        let state = meter.state.lock();
        let total: Duration = state.samples.iter().map(|s| s.duration).sum();
        assert!(total <= Duration::from_millis(10));
    }
}
