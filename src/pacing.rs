//! Send pacing.
//!
//! Middleboxes on consumer paths drop bursts long before they drop a steady
//! trickle, so every outgoing packet waits for a minimum inter-packet gap.
//! The gap is the larger of the configured base gap and an adaptive term
//! derived from queue depth over the observed drain rate.

use std::time::{Duration, Instant};

/// Waits shorter than this spin instead of yielding to the scheduler.
pub const SPIN_THRESHOLD: Duration = Duration::from_micros(50);

/// Packets between drain-rate reestimations.
const UPDATE_INTERVAL_PACKETS: u32 = 64;

/// Upper bound on the adaptive gap so a deep queue cannot stall the sender.
const MAX_ADAPTIVE_GAP: Duration = Duration::from_millis(5);

/// Exponential smoothing factor for the drain-rate estimate.
const SMOOTHING: f64 = 0.2;

/// Inter-packet gap controller, one per direction per connection.
pub struct Pacer {
    base_gap: Duration,
    adaptive_gap: Duration,
    last_send: Option<Instant>,
    sent_since_update: u32,
    window_started: Instant,
    drain_rate_pps: f64,
}

impl Pacer {
    /// Create a pacer with the given base gap in microseconds.
    pub fn new(base_gap_us: u64) -> Self {
        let base_gap = Duration::from_micros(base_gap_us);
        // Seed the drain estimate from the base gap so the first adaptive
        // window has a sane denominator.
        let seed_pps = if base_gap_us > 0 {
            1_000_000.0 / base_gap_us as f64
        } else {
            10_000.0
        };

        Self {
            base_gap,
            adaptive_gap: Duration::ZERO,
            last_send: None,
            sent_since_update: 0,
            window_started: Instant::now(),
            drain_rate_pps: seed_pps,
        }
    }

    /// Wait until the next packet may be sent, then account for it.
    ///
    /// `queue_depth` is the current depth of the send queue feeding this
    /// pacer; it drives the adaptive term.
    pub async fn pace(&mut self, queue_depth: usize) {
        let gap = self.current_gap();
        if let Some(last) = self.last_send {
            let elapsed = last.elapsed();
            if elapsed < gap {
                let wait = gap - elapsed;
                if wait < SPIN_THRESHOLD {
                    let deadline = Instant::now() + wait;
                    while Instant::now() < deadline {
                        std::hint::spin_loop();
                    }
                } else {
                    tokio::time::sleep(wait).await;
                }
            }
        }
        self.last_send = Some(Instant::now());
        self.record_send(queue_depth);
    }

    /// The gap currently enforced between sends.
    pub fn current_gap(&self) -> Duration {
        self.base_gap.max(self.adaptive_gap)
    }

    /// Observed drain rate in packets per second.
    pub fn drain_rate_pps(&self) -> f64 {
        self.drain_rate_pps
    }

    fn record_send(&mut self, queue_depth: usize) {
        self.sent_since_update += 1;
        if self.sent_since_update < UPDATE_INTERVAL_PACKETS {
            return;
        }

        let elapsed = self.window_started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let window_rate = self.sent_since_update as f64 / elapsed;
            self.drain_rate_pps =
                SMOOTHING * window_rate + (1.0 - SMOOTHING) * self.drain_rate_pps;
        }

        self.adaptive_gap = if self.drain_rate_pps > 0.0 {
            Duration::from_secs_f64(queue_depth as f64 / self.drain_rate_pps)
                .min(MAX_ADAPTIVE_GAP)
        } else {
            Duration::ZERO
        };

        self.sent_since_update = 0;
        self.window_started = Instant::now();
    }
}
