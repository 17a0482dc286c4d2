//! Grouped summaries stored as datasets of their own.

use fxhash::FxHashMap;
use tracing::debug;

use crate::aggregation::{Accumulator, AggregationKind};
use crate::cell::Cell;
use crate::dataset::{DatasetId, GroupSpec};
use crate::error::{Error, Result};
use crate::frame::{Column, Frame, Row};
use crate::schema::Schema;
use crate::store::{FrameOptions, Store};

type Groups = Vec<(Vec<Cell>, Accumulator)>;

pub struct Aggregator<'a> {
	store: &'a dyn Store,
	dataset: DatasetId,
	frame: Frame,
	group: GroupSpec,
	kind: AggregationKind,
	name: String,
}

impl<'a> Aggregator<'a> {
	/// `frame` holds the rows to aggregate: the full table when saving, only
	/// the newly arrived rows when updating.
	pub fn new(
		store: &'a dyn Store,
		dataset: DatasetId,
		frame: Frame,
		group: GroupSpec,
		kind: AggregationKind,
		name: impl Into<String>,
	) -> Self {
		Aggregator {
			store,
			dataset,
			frame,
			group,
			kind,
			name: name.into(),
		}
	}

	/// Aggregates the whole table and stores the result under the dataset's
	/// aggregated datasets. A group that already has an aggregated dataset
	/// gets the new column joined onto it.
	pub fn save(&self, new_columns: Vec<Column>) -> Result<DatasetId> {
		let groups = self.fold(new_columns)?;
		let parent = self.store.dataset(&self.dataset)?;

		if let Some(existing) = parent.aggregated_datasets.get(&self.group) {
			let current = self.store.dframe(existing, FrameOptions::with_state())?;
			let updated = self.write_groups(current, groups, false);
			self.store.replace_observations(existing, updated)?;
			self.store.clear_summary_stats(existing)?;
			debug!(dataset = %self.dataset, aggregated = %existing, group = %self.group, "added aggregation column");
			return Ok(existing.clone());
		}

		let frame = self.write_groups(Frame::new(self.group.columns().to_vec()), groups, false);
		let mut schema = Schema::new();
		for column in self.group.columns() {
			if let Some(declared) = parent.schema.get(column) {
				schema.insert_slug(column, declared.clone());
			}
		}
		schema.extend_from(&frame);

		let id = self.store.create_dataset(schema, frame)?;
		self.store
			.add_aggregated_dataset(&self.dataset, self.group.clone(), id.clone())?;
		debug!(dataset = %self.dataset, aggregated = %id, group = %self.group, "created aggregated dataset");
		Ok(id)
	}

	/// Folds the new rows into the stored aggregation of `aggregated` and
	/// returns the updated table.
	pub fn update(&self, aggregated: &DatasetId, new_columns: Vec<Column>) -> Result<Frame> {
		let groups = self.fold(new_columns)?;
		let current = self.store.dframe(aggregated, FrameOptions::with_state())?;
		let updated = self.write_groups(current, groups, true);

		let stored = self.store.replace_observations(aggregated, updated)?;
		self.store.clear_summary_stats(aggregated)?;
		Ok(stored)
	}

	fn key(&self, row: &Row) -> Vec<Cell> {
		self.group
			.columns()
			.iter()
			.map(|c| row.get(c).cloned().unwrap_or_default())
			.collect()
	}

	fn fold(&self, new_columns: Vec<Column>) -> Result<Groups> {
		let Some(values) = new_columns.into_iter().next() else {
			return Err(Error::Formula(format!("aggregation `{}` produced no column", self.name)));
		};
		if values.len() != self.frame.len() {
			return Err(Error::CalculationExecution {
				name: self.name.clone(),
				row: values.len(),
				message: format!("expected {} values", self.frame.len()),
			});
		}

		let mut index: FxHashMap<Vec<Cell>, usize> = FxHashMap::default();
		let mut groups: Groups = Vec::new();
		for (row, value) in self.frame.rows().iter().zip(values.values.iter()) {
			let key = self.key(row);
			let slot = *index.entry(key.clone()).or_insert_with(|| {
				groups.push((key, Accumulator::new(self.kind)));
				groups.len() - 1
			});
			groups[slot].1.push(value);
		}

		if groups.is_empty() && self.group.is_all() {
			groups.push((Vec::new(), Accumulator::new(self.kind)));
		}
		Ok(groups)
	}

	/// Writes `groups` into `frame`. With `combine` the stored accumulator
	/// of a matching group is merged with the new one, otherwise replaced.
	fn write_groups(&self, frame: Frame, groups: Groups, combine: bool) -> Frame {
		let mut columns = vec![self.name.clone()];
		columns.extend(self.kind.state_columns(&self.name));
		let mut frame = frame.pad(&columns);

		let mut index: FxHashMap<Vec<Cell>, usize> = frame
			.rows()
			.iter()
			.enumerate()
			.map(|(i, row)| (self.key(row), i))
			.collect();

		for (key, acc) in groups {
			match index.get(&key).copied() {
				Some(i) => {
					let row = &mut frame.rows_mut()[i];
					let acc = if combine {
						let mut stored = Accumulator::restore(self.kind, row, &self.name);
						stored.merge(acc);
						stored
					} else {
						acc
					};
					acc.write(row, &self.name);
				}
				None => {
					let mut row: Row = self
						.group
						.columns()
						.iter()
						.cloned()
						.zip(key.iter().cloned())
						.collect();
					acc.write(&mut row, &self.name);
					index.insert(key, frame.len());
					frame.push_row(row);
				}
			}
		}
		frame
	}
}
