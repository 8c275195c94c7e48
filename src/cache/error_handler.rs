//! Debounced error reporting for a single collection.

use std::time::{Duration, Instant};

/// Rate-limits how often a repeating error is surfaced.
///
/// Only reporting is throttled; the stream keeps reconnecting on its own
/// schedule.
#[derive(Debug, Clone)]
pub struct ErrorHandler {
  base_delay: Duration,
  max_delay: Duration,
  last_message: Option<String>,
  last_reported_at: Option<Instant>,
  consecutive_errors: u32,
}

impl Default for ErrorHandler {
  fn default() -> Self {
    Self::new(Duration::from_secs(1), Duration::from_secs(30))
  }
}

impl ErrorHandler {
  pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      base_delay,
      max_delay,
      last_message: None,
      last_reported_at: None,
      consecutive_errors: 0,
    }
  }

  /// Whether `message` should be surfaced now.
  pub fn should_report(&mut self, message: &str) -> bool {
    self.should_report_at(message, Instant::now())
  }

  pub fn should_report_at(&mut self, message: &str, now: Instant) -> bool {
    if self.last_message.as_deref() != Some(message) {
      self.last_message = Some(message.to_string());
      self.consecutive_errors = 0;
      self.last_reported_at = Some(now);
      return true;
    }

    if let Some(last) = self.last_reported_at {
      if now.saturating_duration_since(last) < self.backoff() {
        return false;
      }
    }

    self.consecutive_errors = self.consecutive_errors.saturating_add(1);
    self.last_reported_at = Some(now);
    true
  }

  /// Current suppression window: `base * 2^consecutive`, capped.
  pub fn backoff(&self) -> Duration {
    let factor = 2u32.checked_pow(self.consecutive_errors).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Forget previous failures after a successful response.
  pub fn reset(&mut self) {
    self.last_message = None;
    self.last_reported_at = None;
    self.consecutive_errors = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
  }

  #[test]
  fn test_first_occurrence_reports() {
    let mut handler = ErrorHandler::default();
    assert!(handler.should_report("server down"));
  }

  #[test]
  fn test_backoff_doubles_up_to_ceiling() {
    let mut handler = ErrorHandler::default();
    let mut now = Instant::now();
    assert!(handler.should_report_at("server down", now));

    // Windows: 1s, 2s, 4s, 8s, 16s, then capped at 30s
    for window in [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000] {
      assert!(!handler.should_report_at("server down", now + ms(window - 1)));
      now += ms(window);
      assert!(handler.should_report_at("server down", now));
    }
  }

  #[test]
  fn test_changed_message_reports_immediately_and_resets() {
    let mut handler = ErrorHandler::default();
    let start = Instant::now();
    assert!(handler.should_report_at("a", start));
    assert!(handler.should_report_at("a", start + ms(1_000)));
    assert_eq!(handler.backoff(), ms(2_000));

    assert!(handler.should_report_at("b", start + ms(1_001)));
    assert_eq!(handler.backoff(), ms(1_000));
    assert!(!handler.should_report_at("b", start + ms(1_500)));
  }

  #[test]
  fn test_reset_clears_backoff() {
    let mut handler = ErrorHandler::default();
    let start = Instant::now();
    assert!(handler.should_report_at("a", start));
    assert!(!handler.should_report_at("a", start + ms(10)));

    handler.reset();
    assert!(handler.should_report_at("a", start + ms(20)));
  }

  #[test]
  fn test_huge_counter_does_not_overflow() {
    let mut handler = ErrorHandler::default();
    handler.consecutive_errors = 64;
    assert_eq!(handler.backoff(), Duration::from_secs(30));
  }
}
