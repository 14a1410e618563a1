//! Adaptive call pacing against a fixed upstream quota.
//!
//! The controller spaces calls `target_interval` apart, minus an estimate of
//! the per-call overhead that elapses after [`RateController::pre_call`]
//! returns and before the request reaches the server. A `rate_limited`
//! outcome multiplies the interval and imposes a cooldown; after enough
//! successes the interval steps back down to its base.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;
use tidemark_core::outcome::FetchOutcome;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ─── Config ──────────────────────────────────────────────────────────────────

/// Pacing knobs, durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
  pub calls_per_minute:    u32,
  pub initial_overhead_ms: u64,
  pub overhead_floor_ms:   u64,
  /// Multiplier applied to the overhead estimate after a fast round trip.
  pub overhead_shrink:     f64,
  pub backoff_factor:      f64,
  pub max_interval_ms:     u64,
  /// Pause imposed after a `rate_limited` outcome.
  pub cooldown_ms:         u64,
  /// Successes needed in backoff before the interval steps down.
  pub recovery_successes:  u32,
  pub recovery_factor:     f64,
  /// Log pacing stats every this many calls; 0 disables.
  pub report_every:        u64,
}

impl Default for PacingConfig {
  fn default() -> Self {
    Self {
      calls_per_minute:    75,
      initial_overhead_ms: 150,
      overhead_floor_ms:   20,
      overhead_shrink:     0.9,
      backoff_factor:      2.0,
      max_interval_ms:     60_000,
      cooldown_ms:         60_000,
      recovery_successes:  5,
      recovery_factor:     0.8,
      report_every:        50,
    }
  }
}

impl PacingConfig {
  pub fn target_interval(&self) -> Duration {
    Duration::from_secs(60) / self.calls_per_minute.max(1)
  }

  /// Bring the multiplicative factors into range: `backoff_factor >= 1`,
  /// the other two within `(0, 1]`. Non-finite values revert to defaults.
  fn sanitized(mut self) -> Self {
    let defaults = Self::default();
    self.backoff_factor = if self.backoff_factor.is_finite() {
      self.backoff_factor.max(1.0)
    } else {
      defaults.backoff_factor
    };
    self.overhead_shrink = unit_factor("overhead_shrink", self.overhead_shrink, defaults.overhead_shrink);
    self.recovery_factor = unit_factor("recovery_factor", self.recovery_factor, defaults.recovery_factor);
    self
  }
}

fn unit_factor(name: &str, value: f64, default: f64) -> f64 {
  if value.is_finite() && value > 0.0 {
    value.min(1.0)
  } else {
    warn!(name, value, default, "pacing factor out of range, using default");
    default
  }
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PacerState {
  Normal,
  Backoff,
}

/// Throughput snapshot for progress reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacerStats {
  pub calls:            u64,
  pub rate_limit_hits:  u64,
  pub state:            PacerState,
  pub current_interval: Duration,
  pub overhead:         Duration,
  /// Mean spacing between consecutive calls so far.
  pub mean_interval:    Option<Duration>,
  /// Projected time to finish `remaining` more calls.
  pub eta:              Duration,
}

/// Paces outbound calls. One instance per running extraction.
#[derive(Debug)]
pub struct RateController {
  config:                PacingConfig,
  base_interval:         Duration,
  max_interval:          Duration,
  interval:              Duration,
  overhead:              Duration,
  overhead_floor:        Duration,
  state:                 PacerState,
  last_call:             Option<Instant>,
  cooldown_until:        Option<Instant>,
  consecutive_successes: u32,
  calls:                 u64,
  rate_limit_hits:       u64,
  total_spacing:         Duration,
}

impl Default for RateController {
  fn default() -> Self { Self::new(PacingConfig::default()) }
}

impl RateController {
  pub fn new(config: PacingConfig) -> Self {
    let config = config.sanitized();
    let base_interval = config.target_interval();
    let overhead_floor = Duration::from_millis(config.overhead_floor_ms);
    Self {
      base_interval,
      max_interval: Duration::from_millis(config.max_interval_ms).max(base_interval),
      interval: base_interval,
      overhead: Duration::from_millis(config.initial_overhead_ms).max(overhead_floor),
      overhead_floor,
      state: PacerState::Normal,
      last_call: None,
      cooldown_until: None,
      consecutive_successes: 0,
      calls: 0,
      rate_limit_hits: 0,
      total_spacing: Duration::ZERO,
      config,
    }
  }

  pub fn state(&self) -> PacerState { self.state }

  pub fn interval(&self) -> Duration { self.interval }

  pub fn overhead(&self) -> Duration { self.overhead }

  pub fn report_every(&self) -> u64 { self.config.report_every }

  /// Time `pre_call` would sleep if called now.
  pub fn pending_wait(&self) -> Duration {
    let now = Instant::now();
    let cooldown = self
      .cooldown_until
      .map(|until| until.saturating_duration_since(now))
      .unwrap_or_default();
    let spacing = self
      .last_call
      .map(|last| {
        self
          .interval
          .saturating_sub(now.saturating_duration_since(last))
          .saturating_sub(self.overhead)
      })
      .unwrap_or_default();
    cooldown.max(spacing)
  }

  /// Suspend until the next call may be issued, then mark it started.
  pub async fn pre_call(&mut self) {
    let wait = self.pending_wait();
    if !wait.is_zero() {
      debug!(?wait, state = %self.state, "pacing");
      tokio::time::sleep(wait).await;
    }

    let started = Instant::now();
    if let Some(last) = self.last_call {
      self.total_spacing += started.saturating_duration_since(last);
    }
    self.last_call = Some(started);
    self.calls += 1;
  }

  /// Adapt to the outcome of the call started by the last `pre_call`.
  pub fn post_call(&mut self, outcome: FetchOutcome) {
    let now = Instant::now();
    match outcome {
      FetchOutcome::Success => {
        if let Some(started) = self.last_call
          && now.saturating_duration_since(started) < self.overhead
        {
          self.overhead = self.overhead.mul_f64(self.config.overhead_shrink).max(self.overhead_floor);
        }
        if self.state == PacerState::Backoff {
          self.recover(now);
        }
      }
      FetchOutcome::RateLimited => {
        self.rate_limit_hits += 1;
        self.consecutive_successes = 0;
        self.state = PacerState::Backoff;
        self.interval = Duration::try_from_secs_f64(self.interval.as_secs_f64() * self.config.backoff_factor)
          .map_or(self.max_interval, |backed_off| backed_off.min(self.max_interval));
        if self.config.cooldown_ms > 0 {
          self.cooldown_until = Some(now + Duration::from_millis(self.config.cooldown_ms));
        }
        warn!(
          interval = ?self.interval,
          cooldown_ms = self.config.cooldown_ms,
          "rate limited, backing off"
        );
      }
      FetchOutcome::ApiFailure | FetchOutcome::Empty => {}
    }
  }

  fn recover(&mut self, now: Instant) {
    if self.cooldown_until.is_some_and(|until| now < until) {
      return;
    }
    self.cooldown_until = None;
    self.consecutive_successes += 1;
    if self.consecutive_successes < self.config.recovery_successes {
      return;
    }
    self.consecutive_successes = 0;
    self.interval = self.interval.mul_f64(self.config.recovery_factor).max(self.base_interval);
    if self.interval <= self.base_interval {
      self.interval = self.base_interval;
      self.state = PacerState::Normal;
      info!(interval = ?self.interval, "recovered from rate-limit backoff");
    } else {
      debug!(interval = ?self.interval, "backoff interval reduced");
    }
  }

  pub fn stats(&self, remaining: usize) -> PacerStats {
    let mean_interval =
      (self.calls > 1).then(|| self.total_spacing / (self.calls - 1) as u32);
    let per_call = mean_interval.unwrap_or(self.interval).max(self.interval);
    PacerStats {
      calls: self.calls,
      rate_limit_hits: self.rate_limit_hits,
      state: self.state,
      current_interval: self.interval,
      overhead: self.overhead,
      mean_interval,
      eta: per_call * remaining as u32,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config() -> PacingConfig {
    PacingConfig {
      calls_per_minute: 60,
      initial_overhead_ms: 100,
      overhead_floor_ms: 50,
      cooldown_ms: 5_000,
      recovery_successes: 2,
      recovery_factor: 0.5,
      max_interval_ms: 8_000,
      ..PacingConfig::default()
    }
  }

  #[test]
  fn target_interval_from_quota() {
    assert_eq!(PacingConfig::default().target_interval(), Duration::from_millis(800));
    let zero = PacingConfig { calls_per_minute: 0, ..PacingConfig::default() };
    assert_eq!(zero.target_interval(), Duration::from_secs(60));
  }

  #[tokio::test(start_paused = true)]
  async fn first_call_does_not_wait() {
    let mut pacer = RateController::new(config());
    let start = Instant::now();
    pacer.pre_call().await;
    assert_eq!(start.elapsed(), Duration::ZERO);
  }

  #[tokio::test(start_paused = true)]
  async fn back_to_back_calls_wait_interval_minus_overhead() {
    let mut pacer = RateController::new(config());
    pacer.pre_call().await;
    pacer.post_call(FetchOutcome::ApiFailure);

    let start = Instant::now();
    pacer.pre_call().await;
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(900), "{waited:?}");
    assert!(waited < Duration::from_millis(910), "{waited:?}");
  }

  #[tokio::test(start_paused = true)]
  async fn slow_calls_never_wait() {
    let mut pacer = RateController::new(config());
    pacer.pre_call().await;
    tokio::time::advance(Duration::from_secs(2)).await;
    pacer.post_call(FetchOutcome::Success);

    assert_eq!(pacer.pending_wait(), Duration::ZERO);
    let start = Instant::now();
    pacer.pre_call().await;
    assert_eq!(start.elapsed(), Duration::ZERO);
  }

  #[tokio::test(start_paused = true)]
  async fn fast_round_trips_shrink_overhead_to_floor() {
    let mut pacer = RateController::new(config());
    pacer.pre_call().await;
    pacer.post_call(FetchOutcome::Success);
    assert_eq!(pacer.overhead(), Duration::from_millis(90));

    for _ in 0..20 {
      pacer.pre_call().await;
      pacer.post_call(FetchOutcome::Success);
    }
    assert_eq!(pacer.overhead(), Duration::from_millis(50));
  }

  #[tokio::test(start_paused = true)]
  async fn failures_do_not_change_pacing() {
    let mut pacer = RateController::new(config());
    pacer.pre_call().await;
    pacer.post_call(FetchOutcome::ApiFailure);
    pacer.pre_call().await;
    pacer.post_call(FetchOutcome::Empty);
    assert_eq!(pacer.state(), PacerState::Normal);
    assert_eq!(pacer.interval(), Duration::from_secs(1));
    assert_eq!(pacer.overhead(), Duration::from_millis(100));
  }

  #[tokio::test(start_paused = true)]
  async fn rate_limit_backs_off_and_cools_down() {
    let mut pacer = RateController::new(config());
    pacer.pre_call().await;
    pacer.post_call(FetchOutcome::RateLimited);

    assert_eq!(pacer.state(), PacerState::Backoff);
    assert_eq!(pacer.interval(), Duration::from_secs(2));

    let start = Instant::now();
    pacer.pre_call().await;
    assert!(start.elapsed() >= Duration::from_secs(5));

    // Repeated hits are capped.
    for _ in 0..5 {
      pacer.post_call(FetchOutcome::RateLimited);
    }
    assert_eq!(pacer.interval(), Duration::from_secs(8));
    assert_eq!(pacer.stats(0).rate_limit_hits, 6);
  }

  #[tokio::test(start_paused = true)]
  async fn recovers_after_successes_once_cooldown_elapses() {
    let mut pacer = RateController::new(config());
    pacer.pre_call().await;
    pacer.post_call(FetchOutcome::RateLimited);
    pacer.post_call(FetchOutcome::RateLimited);
    assert_eq!(pacer.interval(), Duration::from_secs(4));

    // Successes inside the cooldown window do not count.
    pacer.post_call(FetchOutcome::Success);
    pacer.post_call(FetchOutcome::Success);
    assert_eq!(pacer.interval(), Duration::from_secs(4));

    pacer.pre_call().await;
    pacer.post_call(FetchOutcome::Success);
    pacer.post_call(FetchOutcome::Success);
    assert_eq!(pacer.interval(), Duration::from_secs(2));
    assert_eq!(pacer.state(), PacerState::Backoff);

    pacer.post_call(FetchOutcome::Success);
    pacer.post_call(FetchOutcome::Success);
    assert_eq!(pacer.interval(), Duration::from_secs(1));
    assert_eq!(pacer.state(), PacerState::Normal);
  }

  #[tokio::test(start_paused = true)]
  async fn out_of_range_factors_are_tamed() {
    let negative = PacingConfig { backoff_factor: -1.0, overhead_shrink: -0.5, ..config() };
    let mut pacer = RateController::new(negative);
    pacer.pre_call().await;
    pacer.post_call(FetchOutcome::Success);
    assert_eq!(pacer.overhead(), Duration::from_millis(90));
    pacer.post_call(FetchOutcome::RateLimited);
    assert_eq!(pacer.interval(), Duration::from_secs(1));

    let nan = PacingConfig { backoff_factor: f64::NAN, recovery_factor: f64::NAN, ..config() };
    let mut pacer = RateController::new(nan);
    pacer.pre_call().await;
    pacer.post_call(FetchOutcome::RateLimited);
    assert_eq!(pacer.interval(), Duration::from_secs(2));
    assert_eq!(pacer.config.recovery_factor, PacingConfig::default().recovery_factor);

    let huge = PacingConfig { backoff_factor: 1e300, recovery_factor: 7.0, ..config() };
    let mut pacer = RateController::new(huge);
    pacer.pre_call().await;
    pacer.post_call(FetchOutcome::RateLimited);
    pacer.post_call(FetchOutcome::RateLimited);
    assert_eq!(pacer.interval(), Duration::from_secs(8));
    assert_eq!(pacer.config.recovery_factor, 1.0);
  }

  #[tokio::test(start_paused = true)]
  async fn stats_project_remaining_time() {
    let mut pacer = RateController::new(config());
    let fresh = pacer.stats(10);
    assert_eq!(fresh.calls, 0);
    assert_eq!(fresh.mean_interval, None);
    assert_eq!(fresh.eta, Duration::from_secs(10));

    for _ in 0..3 {
      pacer.pre_call().await;
      tokio::time::advance(Duration::from_secs(3)).await;
      pacer.post_call(FetchOutcome::Success);
    }
    let stats = pacer.stats(4);
    assert_eq!(stats.calls, 3);
    assert_eq!(stats.mean_interval, Some(Duration::from_secs(3)));
    assert_eq!(stats.eta, Duration::from_secs(12));
  }
}
