use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::{Error, Result};

fn filter(settings: &LoggingSettings) -> Result<EnvFilter> {
	EnvFilter::try_new(&settings.directive)
		.map_err(|err| Error::Config(format!("logging.directive: {err}")))
}

/// Installs the global subscriber. Fails when one is already installed.
pub fn init(settings: &LoggingSettings) -> Result<()> {
	let layer = match settings.format {
		LogFormat::Plain => tracing_subscriber::fmt::layer()
			.with_span_events(FmtSpan::CLOSE)
			.with_filter(filter(settings)?)
			.boxed(),
		LogFormat::Json => tracing_subscriber::fmt::layer()
			.json()
			.flatten_event(true)
			.with_current_span(true)
			.with_span_list(false)
			.with_filter(filter(settings)?)
			.boxed(),
	};

	tracing_subscriber::registry()
		.with(layer)
		.try_init()
		.map_err(|err| Error::Config(err.to_string()))
}
