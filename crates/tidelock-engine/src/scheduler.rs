//! Fixed-timestep tick scheduling.
//!
//! The [`TickScheduler`] converts variable frame time into a whole number of
//! fixed simulation steps. Leftover time stays in the accumulator and is
//! exposed as an interpolation factor for rendering.
//!
//! Two guards keep a slow frame from snowballing:
//!
//! - at most `max_steps_per_frame` steps run per call; if time is still owed
//!   afterwards the accumulator is reset and a [`SpiralOfDeathWarning`] is
//!   returned (the owed time is discarded, never replayed);
//! - an optional horizon (the last tick the authority has confirmed) stalls
//!   stepping in lockstep sessions.
//!
//! # Example
//!
//! ```
//! use tidelock_engine::scheduler::{Flow, TickScheduler};
//!
//! let mut scheduler = TickScheduler::new(10.0, 5);
//! let mut ran = Vec::new();
//! let frame = scheduler.accumulate(25.0, |tick| {
//!     ran.push(tick);
//!     Flow::Continue
//! });
//! assert_eq!(ran, vec![1, 2]);
//! assert_eq!(frame.steps, 2);
//! assert!((frame.alpha - 0.5).abs() < 1e-9);
//! ```

use tidelock_core::Tick;
use tracing::warn;

/// Default simulation rate: 60 ticks per second.
pub const DEFAULT_TIMESTEP_MS: f64 = 1000.0 / 60.0;

/// Default cap on steps per frame.
pub const DEFAULT_MAX_STEPS_PER_FRAME: u32 = 5;

/// Returned by a step callback to continue or stop the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop stepping for this frame. Owed time is capped as when stalled.
    Halt,
}

/// Accumulated time was discarded because a frame owed too many steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpiralOfDeathWarning {
    /// The tick reached when the cap was hit.
    pub tick: Tick,
    /// Time thrown away, in milliseconds.
    pub discarded_ms: f64,
    pub steps_taken: u32,
}

/// Result of one [`TickScheduler::accumulate`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    /// Steps executed in this frame.
    pub steps: u32,
    /// Interpolation factor in `[0, 1]` for rendering between ticks.
    pub alpha: f64,
    /// Present if the step cap was hit.
    pub dropped: Option<SpiralOfDeathWarning>,
    /// Stepping stopped at the horizon or on request.
    pub stalled: bool,
}

/// Fixed-timestep accumulator and tick counter.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    tick: Tick,
    accumulator_ms: f64,
    timestep_ms: f64,
    max_steps_per_frame: u32,
    horizon: Option<Tick>,
}

impl TickScheduler {
    /// Create a scheduler at tick 0.
    ///
    /// # Panics
    ///
    /// Panics if `timestep_ms` is not positive and finite, or if
    /// `max_steps_per_frame` is zero.
    pub fn new(timestep_ms: f64, max_steps_per_frame: u32) -> Self {
        assert!(
            timestep_ms.is_finite() && timestep_ms > 0.0,
            "timestep_ms must be positive and finite, got {timestep_ms}"
        );
        assert!(max_steps_per_frame > 0, "max_steps_per_frame must be > 0");
        Self {
            tick: 0,
            accumulator_ms: 0.0,
            timestep_ms,
            max_steps_per_frame,
            horizon: None,
        }
    }

    /// Add elapsed time and run as many whole steps as it pays for.
    ///
    /// `on_step` receives each new tick number, already incremented.
    /// Negative or non-finite deltas are treated as zero.
    pub fn accumulate<F>(&mut self, delta_ms: f64, mut on_step: F) -> Frame
    where
        F: FnMut(Tick) -> Flow,
    {
        if delta_ms.is_finite() && delta_ms > 0.0 {
            self.accumulator_ms += delta_ms;
        } else if delta_ms != 0.0 {
            warn!(delta_ms, "ignoring invalid frame delta");
        }

        let mut steps = 0;
        let mut stalled = false;
        while self.accumulator_ms >= self.timestep_ms && steps < self.max_steps_per_frame {
            if self.horizon.is_some_and(|h| self.tick >= h) {
                stalled = true;
                break;
            }
            self.accumulator_ms -= self.timestep_ms;
            self.tick += 1;
            steps += 1;
            if on_step(self.tick) == Flow::Halt {
                stalled = true;
                break;
            }
        }

        let budget_ms = self.timestep_ms * f64::from(self.max_steps_per_frame);
        let mut dropped = None;
        if stalled {
            // Waiting on the authority or a resync: remember at most one
            // frame's worth of owed time.
            self.accumulator_ms = self.accumulator_ms.min(budget_ms);
        } else if self.accumulator_ms >= self.timestep_ms {
            let warning = SpiralOfDeathWarning {
                tick: self.tick,
                discarded_ms: self.accumulator_ms,
                steps_taken: steps,
            };
            warn!(
                tick = warning.tick,
                discarded_ms = warning.discarded_ms,
                steps,
                "frame exceeded step cap; discarding accumulated time"
            );
            self.accumulator_ms = 0.0;
            dropped = Some(warning);
        }

        Frame {
            steps,
            alpha: self.alpha(),
            dropped,
            stalled,
        }
    }

    /// Run exactly one step regardless of accumulated time or horizon.
    pub fn step<F: FnOnce(Tick)>(&mut self, on_step: F) -> Tick {
        self.tick += 1;
        on_step(self.tick);
        self.tick
    }

    /// Leftover time as a fraction of one timestep, clamped to `[0, 1]`.
    pub fn alpha(&self) -> f64 {
        (self.accumulator_ms / self.timestep_ms).clamp(0.0, 1.0)
    }

    /// The last tick executed (0 before the first step).
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn accumulator_ms(&self) -> f64 {
        self.accumulator_ms
    }

    pub fn timestep_ms(&self) -> f64 {
        self.timestep_ms
    }

    pub fn max_steps_per_frame(&self) -> u32 {
        self.max_steps_per_frame
    }

    pub fn horizon(&self) -> Option<Tick> {
        self.horizon
    }

    /// Limit stepping to ticks at or below `horizon`; `None` removes the
    /// limit.
    pub fn set_horizon(&mut self, horizon: Option<Tick>) {
        self.horizon = horizon;
    }

    /// Jump to a restored position in time.
    pub(crate) fn restore(&mut self, tick: Tick, accumulator_ms: f64) {
        self.tick = tick;
        self.accumulator_ms = accumulator_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(scheduler: &mut TickScheduler, delta_ms: f64) -> (Frame, Vec<Tick>) {
        let mut ticks = Vec::new();
        let frame = scheduler.accumulate(delta_ms, |t| {
            ticks.push(t);
            Flow::Continue
        });
        (frame, ticks)
    }

    #[test]
    fn exact_multiple_runs_that_many_steps() {
        let mut s = TickScheduler::new(10.0, 5);
        let (frame, ticks) = run(&mut s, 30.0);
        assert_eq!(ticks, vec![1, 2, 3]);
        assert_eq!(frame.steps, 3);
        assert_eq!(frame.alpha, 0.0);
        assert!(frame.dropped.is_none());
    }

    #[test]
    fn remainder_carries_over_and_sets_alpha() {
        let mut s = TickScheduler::new(10.0, 5);
        let (frame, _) = run(&mut s, 15.0);
        assert_eq!(frame.steps, 1);
        assert!((frame.alpha - 0.5).abs() < 1e-9);

        let (frame, ticks) = run(&mut s, 5.0);
        assert_eq!(ticks, vec![2]);
        assert!(frame.alpha.abs() < 1e-9);
    }

    #[test]
    fn step_cap_discards_owed_time() {
        let mut s = TickScheduler::new(16.0, 5);
        let (frame, ticks) = run(&mut s, 1000.0);
        assert_eq!(ticks.len(), 5);
        assert_eq!(s.accumulator_ms(), 0.0);
        let warning = frame.dropped.expect("cap should trigger");
        assert_eq!(warning.tick, 5);
        assert!((warning.discarded_ms - 920.0).abs() < 1e-9);

        // The next frame starts fresh, no burst of catch-up ticks.
        let (_, ticks) = run(&mut s, 16.0);
        assert_eq!(ticks, vec![6]);
    }

    #[test]
    fn horizon_stalls_and_caps_owed_time() {
        let mut s = TickScheduler::new(10.0, 3);
        s.set_horizon(Some(2));
        let (frame, ticks) = run(&mut s, 100.0);
        assert_eq!(ticks, vec![1, 2]);
        assert!(frame.stalled);
        assert!(frame.dropped.is_none());
        assert_eq!(s.accumulator_ms(), 30.0);

        s.set_horizon(Some(10));
        let (_, ticks) = run(&mut s, 0.0);
        assert_eq!(ticks, vec![3, 4, 5]);
    }

    #[test]
    fn halt_stops_the_frame() {
        let mut s = TickScheduler::new(10.0, 5);
        let frame = s.accumulate(50.0, |t| if t == 2 { Flow::Halt } else { Flow::Continue });
        assert_eq!(frame.steps, 2);
        assert!(frame.stalled);
        assert_eq!(s.tick(), 2);
    }

    #[test]
    fn invalid_deltas_are_ignored() {
        let mut s = TickScheduler::new(10.0, 5);
        let (frame, _) = run(&mut s, -5.0);
        assert_eq!(frame.steps, 0);
        let (frame, _) = run(&mut s, f64::NAN);
        assert_eq!(frame.steps, 0);
        assert_eq!(s.accumulator_ms(), 0.0);
    }

    #[test]
    fn explicit_step_ignores_accumulator() {
        let mut s = TickScheduler::new(10.0, 5);
        let mut seen = 0;
        assert_eq!(s.step(|t| seen = t), 1);
        assert_eq!(seen, 1);
        assert_eq!(s.accumulator_ms(), 0.0);
    }

    #[test]
    #[should_panic(expected = "timestep_ms must be positive")]
    fn zero_timestep_panics() {
        let _ = TickScheduler::new(0.0, 5);
    }
}
