//! The dataset store contract and an in-memory implementation.
//!
//! The store is the only durable owner of dataset state. Replacing
//! observations is a wholesale, last-writer-wins overwrite.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::dataset::{Calculation, Dataset, DatasetId, GroupSpec, JoinLink, JoinSide};
use crate::error::{Error, Result};
use crate::frame::{is_internal_column, is_state_column, Frame, PARENT_ID};
use crate::hashed::Hashed;
use crate::schema::Schema;
use crate::stats::{summarize, summarize_grouped, GroupedStats, SummaryStats};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameOptions {
	pub limit: Option<usize>,
	/// Keep the merge provenance column.
	pub keep_parent_ids: bool,
	/// Add declared schema columns missing from the table.
	pub padded: bool,
	/// Keep aggregation state columns.
	pub keep_state: bool,
}

impl FrameOptions {
	pub fn with_parent_ids() -> Self {
		FrameOptions {
			keep_parent_ids: true,
			..Default::default()
		}
	}

	pub fn with_state() -> Self {
		FrameOptions {
			keep_state: true,
			..Default::default()
		}
	}

	/// The table exactly as stored, internal columns included.
	pub fn complete() -> Self {
		FrameOptions {
			keep_parent_ids: true,
			keep_state: true,
			..Default::default()
		}
	}

	pub fn padded() -> Self {
		FrameOptions {
			padded: true,
			..Default::default()
		}
	}

	pub fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}
}

pub trait Store: Send + Sync {
	/// Fresh snapshot of the dataset metadata.
	fn dataset(&self, id: &DatasetId) -> Result<Dataset>;

	fn dframe(&self, id: &DatasetId, options: FrameOptions) -> Result<Frame>;

	/// Overwrites the row set, extends the schema with new columns and
	/// returns the stored table.
	fn replace_observations(&self, id: &DatasetId, frame: Frame) -> Result<Frame>;

	fn remove_parent_observations(&self, id: &DatasetId, parent: &DatasetId) -> Result<()>;

	fn clear_summary_stats(&self, id: &DatasetId) -> Result<()>;

	fn create_dataset(&self, schema: Schema, frame: Frame) -> Result<DatasetId>;

	fn add_calculation(&self, id: &DatasetId, calculation: Calculation) -> Result<()>;

	fn add_aggregated_dataset(
		&self,
		id: &DatasetId,
		group: GroupSpec,
		aggregated: DatasetId,
	) -> Result<()>;
}

struct Entry {
	meta: Dataset,
	observations: Hashed<Frame>,
	stats: Option<SummaryStats>,
}

impl Entry {
	fn new(meta: Dataset, frame: Frame) -> Self {
		let mut entry = Entry {
			meta,
			observations: Hashed::default(),
			stats: None,
		};
		entry.store(frame);
		entry
	}

	fn store(&mut self, frame: Frame) {
		self.meta.schema.extend_from(&frame);
		self.meta.num_rows = frame.len();
		self.meta.num_columns = frame
			.columns()
			.iter()
			.filter(|c| !is_internal_column(c))
			.count();
		if !self.observations.replace(frame) {
			tracing::trace!(dataset = %self.meta.id, "observations unchanged");
		}
	}
}

/// Store keeping every dataset in process memory, indexed by id.
#[derive(Default)]
pub struct MemoryStore {
	datasets: RwLock<FxHashMap<DatasetId, Entry>>,
}

impl MemoryStore {
	pub fn new() -> Arc<Self> {
		Arc::new(MemoryStore::default())
	}

	fn read<R>(&self, id: &DatasetId, func: impl FnOnce(&Entry) -> R) -> Result<R> {
		let datasets = self.datasets.read();
		let entry = datasets
			.get(id)
			.ok_or_else(|| Error::UnknownDataset(id.clone()))?;
		Ok(func(entry))
	}

	fn write<R>(&self, id: &DatasetId, func: impl FnOnce(&mut Entry) -> R) -> Result<R> {
		let mut datasets = self.datasets.write();
		let entry = datasets
			.get_mut(id)
			.ok_or_else(|| Error::UnknownDataset(id.clone()))?;
		Ok(func(entry))
	}

	/// Creates a ready dataset holding `frame`.
	pub fn create(&self, schema: Schema, frame: Frame) -> DatasetId {
		let id = DatasetId::generate();
		self.insert(Dataset::new(id.clone(), schema), frame);
		id
	}

	pub fn insert(&self, meta: Dataset, frame: Frame) {
		let id = meta.id.clone();
		self.datasets.write().insert(id, Entry::new(meta, frame));
	}

	pub fn set_ready(&self, id: &DatasetId, ready: bool) -> Result<()> {
		self.write(id, |entry| entry.meta.ready = ready)
	}

	/// Fingerprint of the stored observations.
	pub fn version(&self, id: &DatasetId) -> Result<u64> {
		self.read(id, |entry| entry.observations.hash())
	}

	pub fn summary_stats(&self, id: &DatasetId) -> Result<SummaryStats> {
		if let Some(stats) = self.read(id, |entry| entry.stats.clone())? {
			return Ok(stats);
		}
		self.write(id, |entry| {
			let stats = summarize(&entry.meta.schema, &entry.observations);
			entry.stats = Some(stats.clone());
			stats
		})
	}

	/// Sums of the numeric columns per value of `group`. Not cached.
	pub fn grouped_stats(&self, id: &DatasetId, group: &GroupSpec) -> Result<GroupedStats> {
		self.read(id, |entry| {
			let frame: &Frame = &entry.observations;
			if let Some(missing) = group.columns().iter().find(|c| !frame.has_column(c)) {
				return Err(Error::Formula(format!(
					"group `{missing}` is not a column of dataset {id}"
				)));
			}
			Ok(summarize_grouped(&entry.meta.schema, frame, group))
		})?
	}

	pub fn has_cached_stats(&self, id: &DatasetId) -> Result<bool> {
		self.read(id, |entry| entry.stats.is_some())
	}

	/// Creates a dataset holding the union of `parents`, each row tagged with
	/// its origin, and registers it as merged child of every parent.
	pub fn merge(&self, parents: &[DatasetId]) -> Result<DatasetId> {
		let mut schema = Schema::new();
		let mut frame = Frame::default();
		for parent in parents {
			let meta = self.dataset(parent)?;
			for (slug, column) in meta.schema.iter() {
				schema.insert_slug(slug, column.clone());
			}
			let rows = self.dframe(parent, FrameOptions::default())?;
			frame = frame.concat(rows.with_parent(parent));
		}

		let id = self.create(schema, frame);
		for parent in parents {
			self.write(parent, |entry| entry.meta.merged_datasets.push(id.clone()))?;
		}
		tracing::debug!(merged = %id, parents = parents.len(), "created merged dataset");
		Ok(id)
	}

	/// Creates the dataset of `rows` joined with `lookup` on `on`.
	///
	/// `lookup` becomes the left side of the join and must stay unique on
	/// `on`, `rows` becomes the right side.
	pub fn join(&self, rows: &DatasetId, lookup: &DatasetId, on: &str) -> Result<DatasetId> {
		let lookup_frame = self.dframe(lookup, FrameOptions::default())?;
		if !lookup_frame.is_unique(on) {
			return Err(Error::NonUniqueJoin {
				dataset: lookup.clone(),
				on: on.to_owned(),
			});
		}

		let joined = self
			.dframe(rows, FrameOptions::default())?
			.join_frame(&lookup_frame, on);
		let mut schema = self.dataset(rows)?.schema;
		for (slug, column) in self.dataset(lookup)?.schema.iter() {
			if slug != on {
				schema.insert_slug(slug, column.clone());
			}
		}

		let id = self.create(schema, joined);
		self.write(lookup, |entry| {
			entry.meta.joined_datasets.push(JoinLink {
				side: JoinSide::Left,
				other: rows.clone(),
				on: on.to_owned(),
				result: id.clone(),
			})
		})?;
		self.write(rows, |entry| {
			entry.meta.joined_datasets.push(JoinLink {
				side: JoinSide::Right,
				other: lookup.clone(),
				on: on.to_owned(),
				result: id.clone(),
			})
		})?;
		tracing::debug!(joined = %id, %on, "created joined dataset");
		Ok(id)
	}
}

impl Store for MemoryStore {
	fn dataset(&self, id: &DatasetId) -> Result<Dataset> {
		self.read(id, |entry| entry.meta.clone())
	}

	fn dframe(&self, id: &DatasetId, options: FrameOptions) -> Result<Frame> {
		let (frame, slugs) = self.read(id, |entry| {
			let slugs: Vec<String> = if options.padded {
				entry.meta.schema.slugs().cloned().collect()
			} else {
				Vec::new()
			};
			((*entry.observations).clone(), slugs)
		})?;

		let mut frame = frame.drop_columns(|c| {
			(c == PARENT_ID && !options.keep_parent_ids) || (is_state_column(c) && !options.keep_state)
		});
		if options.padded {
			frame = frame.pad(&slugs);
		}
		if let Some(limit) = options.limit {
			frame = frame.truncate(limit);
		}
		Ok(frame)
	}

	fn replace_observations(&self, id: &DatasetId, frame: Frame) -> Result<Frame> {
		self.write(id, |entry| {
			entry.store(frame);
			(*entry.observations).clone()
		})
	}

	fn remove_parent_observations(&self, id: &DatasetId, parent: &DatasetId) -> Result<()> {
		self.write(id, |entry| {
			let remaining = (*entry.observations).clone().without_parent(parent);
			entry.store(remaining);
		})
	}

	fn clear_summary_stats(&self, id: &DatasetId) -> Result<()> {
		self.write(id, |entry| entry.stats = None)
	}

	fn create_dataset(&self, schema: Schema, frame: Frame) -> Result<DatasetId> {
		Ok(self.create(schema, frame))
	}

	fn add_calculation(&self, id: &DatasetId, calculation: Calculation) -> Result<()> {
		self.write(id, |entry| {
			entry
				.meta
				.calculations
				.retain(|c| c.name != calculation.name);
			entry.meta.calculations.push(calculation);
		})
	}

	fn add_aggregated_dataset(
		&self,
		id: &DatasetId,
		group: GroupSpec,
		aggregated: DatasetId,
	) -> Result<()> {
		self.write(id, |entry| {
			entry.meta.aggregated_datasets.insert(group, aggregated);
		})
	}
}
