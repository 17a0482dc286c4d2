use std::sync::Arc;

use crate::calculator::{Calculator, Update};
use crate::config::Settings;
use crate::dataset::DatasetId;
use crate::dispatch::{execute, Dispatch, UpdateTask};
use crate::error::Result;
use crate::formula::{Compile, Parser};
use crate::store::Store;

/// Collaborators shared by every calculator. Cheap to clone, tasks rebuild
/// their calculator from it on the receiving side.
#[derive(Clone)]
pub struct Engine {
	pub store: Arc<dyn Store>,
	pub compiler: Arc<dyn Compile>,
	pub dispatcher: Arc<dyn Dispatch>,
	pub settings: Arc<Settings>,
}

impl Engine {
	pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn Dispatch>) -> Self {
		Engine {
			store,
			compiler: Arc::new(Parser),
			dispatcher,
			settings: Arc::new(Settings::default()),
		}
	}

	pub fn with_compiler(mut self, compiler: Arc<dyn Compile>) -> Self {
		self.compiler = compiler;
		self
	}

	pub fn with_settings(mut self, settings: Settings) -> Self {
		self.settings = Arc::new(settings);
		self
	}

	pub fn calculator(&self, dataset: DatasetId) -> Calculator<'_> {
		Calculator::new(self, dataset)
	}

	/// Appends `update` to `dataset` and starts propagation. Returns once the
	/// dataset itself is consistent, downstream datasets follow through the
	/// dispatcher. A dataset that is not ready yet gets the update retried
	/// through the dispatcher, the caller sees `Ok`.
	pub fn update(&self, dataset: &DatasetId, update: Update) -> Result<()> {
		execute(self, UpdateTask::new(dataset.clone(), update))
	}
}
