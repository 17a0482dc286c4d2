//! Runtime settings.
//!
//! ```toml
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 250
//! max_delay_ms = 10000
//!
//! [logging]
//! directive = "ripple=debug"
//! format = "json"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub retry: RetrySettings,
	pub logging: LoggingSettings,
}

/// Backoff for units that found their dataset not ready.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
	/// Total attempts, the first one included.
	pub max_attempts: u32,
	pub base_delay_ms: u64,
	pub max_delay_ms: u64,
}

impl Default for RetrySettings {
	fn default() -> Self {
		RetrySettings {
			max_attempts: 5,
			base_delay_ms: 250,
			max_delay_ms: 10_000,
		}
	}
}

impl RetrySettings {
	/// Delay before re-running a unit that failed on `attempt` (0-based).
	pub fn delay(&self, attempt: u32) -> Duration {
		let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
		Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
	}

	pub fn allows_retry(&self, attempt: u32) -> bool {
		attempt + 1 < self.max_attempts
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Plain,
	Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
	pub directive: String,
	pub format: LogFormat,
}

impl Default for LoggingSettings {
	fn default() -> Self {
		LoggingSettings {
			directive: "info".to_owned(),
			format: LogFormat::Plain,
		}
	}
}

impl Settings {
	pub fn from_toml_str(source: &str) -> Result<Self> {
		let settings: Settings = toml::from_str(source)?;
		settings.validate()
	}

	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let source = std::fs::read_to_string(path)?;
		Settings::from_toml_str(&source)
	}

	/// Applies `RIPPLE_MAX_ATTEMPTS`, `RIPPLE_BASE_DELAY_MS` and `RIPPLE_LOG`.
	pub fn with_env_overrides(self) -> Result<Self> {
		self.with_overrides(|key| std::env::var(key).ok())
	}

	fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
		fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
			value
				.parse()
				.map_err(|_| Error::Config(format!("{key}: cannot parse `{value}`")))
		}

		if let Some(value) = var("RIPPLE_MAX_ATTEMPTS") {
			self.retry.max_attempts = parse("RIPPLE_MAX_ATTEMPTS", value)?;
		}
		if let Some(value) = var("RIPPLE_BASE_DELAY_MS") {
			self.retry.base_delay_ms = parse("RIPPLE_BASE_DELAY_MS", value)?;
		}
		if let Some(value) = var("RIPPLE_LOG") {
			self.logging.directive = value;
		}
		self.validate()
	}

	fn validate(self) -> Result<Self> {
		if self.retry.max_attempts == 0 {
			return Err(Error::Config("retry.max_attempts must be at least 1".into()));
		}
		if self.retry.base_delay_ms > self.retry.max_delay_ms {
			return Err(Error::Config(
				"retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
			));
		}
		Ok(self)
	}
}
