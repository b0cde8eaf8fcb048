use std::sync::Once;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Off,
}
impl LogLevel {
  pub const MIN: LogLevel = LogLevel::Trace;

  /// The filter directive for this level.
  pub fn directive(self) -> &'static str {
    match self {
      LogLevel::Trace => "trace",
      LogLevel::Debug => "debug",
      LogLevel::Info => "info",
      LogLevel::Warn => "warn",
      LogLevel::Error => "error",
      LogLevel::Off => "off",
    }
  }
}

static INIT: Once = Once::new();

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`. Only the first call
/// has an effect.
pub fn init_logging(level: LogLevel) {
  INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let _ = tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_target(false)
      .try_init();
  });
}

#[test]
fn test_log_levels() {
  assert!(LogLevel::MIN <= LogLevel::Warn);
  assert_eq!(LogLevel::Debug.directive(), "debug");
  init_logging(LogLevel::Off);
  init_logging(LogLevel::Trace);
}
