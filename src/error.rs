use thiserror::Error;

use crate::dataset::DatasetId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
	/// Bad formula syntax, an unknown referenced column or an unknown
	/// group column. Nothing is persisted.
	#[error("formula error: {0}")]
	Formula(String),

	/// An update would break the uniqueness of a join key.
	#[error("join on `{on}` of dataset {dataset} is not unique")]
	NonUniqueJoin { dataset: DatasetId, on: String },

	/// The dataset is still being built. The unit that hit it is retried.
	#[error("dataset {0} is not ready")]
	NotReady(DatasetId),

	/// A compiled formula failed while being applied to a row.
	#[error("calculation `{name}` failed on row {row}: {message}")]
	CalculationExecution {
		name: String,
		row: usize,
		message: String,
	},

	#[error("unknown dataset {0}")]
	UnknownDataset(DatasetId),

	#[error("cannot convert {value} for column `{column}`")]
	Conversion { column: String, value: String },

	#[error("invalid configuration: {0}")]
	Config(String),
}

impl Error {
	pub fn is_retryable(&self) -> bool {
		matches!(self, Error::NotReady(_))
	}
}

impl From<toml::de::Error> for Error {
	fn from(err: toml::de::Error) -> Self {
		Error::Config(err.to_string())
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Config(err.to_string())
	}
}
