//! Per-session frame admission.
//!
//! The pipeline is deliberately shallow: a counter of frames admitted but not
//! yet answered, capped at the configured maximum, plus a minimum wall-clock
//! gap between admissions. Anything arriving past either limit is dropped
//! silently (drops are normal flow control here, not errors) and steady-state
//! latency stays pinned to inference time instead of queue depth.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

/// Counters shared between the session's dispatch task (admission) and its
/// worker thread (completion and stats reads).
#[derive(Debug, Default)]
pub struct PipelineStats {
    in_flight: AtomicU32,
    dropped: AtomicU64,
    admitted: AtomicU64,
}

impl PipelineStats {
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Acquire)
    }

    /// Mark one admitted frame as answered. A reply of any kind counts:
    /// success and error envelopes both release the slot. Clamped at zero so
    /// a stray double-completion cannot wedge the gate open.
    pub fn complete(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }
}

/// Admission gate owned by the session's dispatch loop.
pub struct FramePipeline {
    stats: Arc<PipelineStats>,
    max_in_flight: u32,
    min_interval: Duration,
    last_accept: Option<Instant>,
}

impl FramePipeline {
    pub fn new(max_in_flight: u32, min_interval: Duration) -> Self {
        Self {
            stats: Arc::new(PipelineStats::default()),
            max_in_flight,
            min_interval,
            last_accept: None,
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Decide whether a frame arriving at `now` may enter the pipeline.
    ///
    /// Admission increments the in-flight counter immediately; the matching
    /// decrement happens when the worker hands the reply to the writer.
    pub fn admit(&mut self, now: Instant) -> bool {
        if self.stats.in_flight.load(Ordering::Acquire) >= self.max_in_flight {
            self.drop_frame("in-flight cap");
            return false;
        }
        if let Some(last) = self.last_accept {
            if now.duration_since(last) < self.min_interval {
                self.drop_frame("rate limit");
                return false;
            }
        }
        self.last_accept = Some(now);
        self.stats.in_flight.fetch_add(1, Ordering::AcqRel);
        self.stats.admitted.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn drop_frame(&self, reason: &'static str) {
        let dropped = self.stats.dropped.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::counter!("gateway_frames_dropped_total", "reason" => reason).increment(1);
        debug!("dropping frame ({reason}, dropped total: {dropped})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> FramePipeline {
        FramePipeline::new(2, Duration::from_millis(33))
    }

    #[test]
    fn admission_respects_the_in_flight_cap() {
        let mut pipeline = pipeline();
        let stats = pipeline.stats();
        let start = Instant::now();

        assert!(pipeline.admit(start));
        assert!(pipeline.admit(start + Duration::from_millis(40)));
        assert_eq!(stats.in_flight(), 2);

        // Third frame hits the cap no matter how much time has passed.
        assert!(!pipeline.admit(start + Duration::from_secs(5)));
        assert_eq!(stats.in_flight(), 2);
        assert_eq!(stats.dropped(), 1);
    }

    #[test]
    fn completion_reopens_the_gate() {
        let mut pipeline = pipeline();
        let stats = pipeline.stats();
        let start = Instant::now();

        assert!(pipeline.admit(start));
        assert!(pipeline.admit(start + Duration::from_millis(40)));
        stats.complete();
        assert_eq!(stats.in_flight(), 1);
        assert!(pipeline.admit(start + Duration::from_millis(80)));
    }

    #[test]
    fn frames_inside_the_interval_are_dropped() {
        let mut pipeline = pipeline();
        let stats = pipeline.stats();
        let start = Instant::now();

        assert!(pipeline.admit(start));
        stats.complete();
        assert!(!pipeline.admit(start + Duration::from_millis(10)));
        assert_eq!(stats.dropped(), 1);
        // The rejected frame must not reset the interval clock.
        assert!(pipeline.admit(start + Duration::from_millis(34)));
    }

    #[test]
    fn in_flight_never_exceeds_the_cap_under_bursts() {
        let mut pipeline = pipeline();
        let stats = pipeline.stats();
        let start = Instant::now();

        let mut replies = 0u64;
        for i in 0..100u64 {
            let now = start + Duration::from_millis(i * 10);
            if pipeline.admit(now) {
                assert!(stats.in_flight() <= 2);
                // Simulate the worker answering every other tick.
                if i % 2 == 0 {
                    stats.complete();
                    replies += 1;
                }
            }
        }
        assert_eq!(stats.admitted(), replies + stats.in_flight() as u64);
        assert_eq!(stats.admitted() + stats.dropped(), 100);
    }

    #[test]
    fn completion_clamps_at_zero() {
        let pipeline = pipeline();
        let stats = pipeline.stats();
        stats.complete();
        stats.complete();
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn zero_interval_disables_rate_limiting() {
        let mut pipeline = FramePipeline::new(10, Duration::ZERO);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(pipeline.admit(now));
        }
    }
}
