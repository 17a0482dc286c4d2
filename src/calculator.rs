//! Recalculation of one dataset and propagation of its changes.
//!
//! A [`Calculator`] is bound to a single dataset and holds nothing but the
//! [`Engine`] it was built from: every step reads the stored table afresh,
//! so a calculator may be kept across other writers' updates. Everything it changes on other datasets either happens through
//! the store directly (merged column propagation, left join results) or is
//! handed to the dispatcher as a plain data [`UpdateTask`].

use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::aggregation::AggregationKind;
use crate::aggregator::Aggregator;
use crate::cell::Cell;
use crate::dataset::{Calculation, Dataset, DatasetId, GroupSpec, JoinLink, JoinSide};
use crate::dispatch::UpdateTask;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::formula::Compiled;
use crate::frame::{is_internal_column, Column, Frame, RawRow, Row};
use crate::graph::{edges, Edge, Trail};
use crate::schema::{slugify, Schema};
use crate::store::{FrameOptions, Store};

/// New observations for [`Calculator::calculate_updates`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Update {
	/// Rows keyed by column label or slug, converted with the dataset schema.
	Rows(Vec<RawRow>),
	/// A table already shaped for the dataset, such as freshly joined rows.
	Compiled(Frame),
}

impl From<Vec<RawRow>> for Update {
	fn from(rows: Vec<RawRow>) -> Self {
		Update::Rows(rows)
	}
}

impl From<RawRow> for Update {
	fn from(row: RawRow) -> Self {
		Update::Rows(vec![row])
	}
}

/// Columns an update may write.
enum Accepted {
	Columns(FxHashSet<String>),
	/// Dataset without schema or rows: every column is taken, slugified.
	Any,
}

struct AggregateTarget {
	meta: Dataset,
	labels_to_slugs: FxHashMap<String, String>,
}

/// Lookups derived once at the start of an update cycle.
struct UpdateContext {
	labels_to_slugs: FxHashMap<String, String>,
	accepted: Accepted,
	aggregates: FxHashMap<GroupSpec, AggregateTarget>,
}

impl UpdateContext {
	fn build(store: &dyn Store, meta: &Dataset, existing: &Frame) -> Self {
		let visible: FxHashSet<String> = existing
			.columns()
			.iter()
			.filter(|c| !is_internal_column(c))
			.cloned()
			.collect();
		let accepted = if !visible.is_empty() {
			Accepted::Columns(visible)
		} else if !meta.schema.is_empty() {
			Accepted::Columns(meta.schema.slugs().cloned().collect())
		} else {
			Accepted::Any
		};

		let mut aggregates = FxHashMap::default();
		for (group, id) in &meta.aggregated_datasets {
			match store.dataset(id) {
				Ok(aggregated) => {
					let labels_to_slugs = aggregated.schema.labels_to_slugs();
					aggregates.insert(
						group.clone(),
						AggregateTarget {
							meta: aggregated,
							labels_to_slugs,
						},
					);
				}
				Err(err) => warn!(dataset = %meta.id, aggregated = %id, %err, "aggregated dataset unavailable"),
			}
		}

		UpdateContext {
			labels_to_slugs: meta.schema.labels_to_slugs(),
			accepted,
			aggregates,
		}
	}

	fn slug_for(&self, key: &str) -> Option<String> {
		match &self.accepted {
			Accepted::Any => Some(
				self.labels_to_slugs
					.get(key)
					.cloned()
					.unwrap_or_else(|| slugify(key)),
			),
			Accepted::Columns(columns) => {
				let slug = self.labels_to_slugs.get(key).map_or(key, String::as_str);
				columns.contains(slug).then(|| slug.to_owned())
			}
		}
	}

	/// Column a row calculation writes to, `None` for aggregations.
	fn calculation_target(&self, existing: &Frame, name: &str) -> Option<String> {
		if existing.has_column(name) {
			return Some(name.to_owned());
		}
		self.labels_to_slugs.get(name).cloned()
	}
}

/// Runs every function of `compiled` over the rows of `frame`.
fn apply(compiled: &Compiled, frame: &Frame, name: &str) -> Result<Vec<Column>> {
	compiled
		.functions
		.iter()
		.enumerate()
		.map(|(i, function)| {
			let values = frame
				.rows()
				.iter()
				.enumerate()
				.map(|(row, values)| {
					function(values).map_err(|message| Error::CalculationExecution {
						name: name.to_owned(),
						row,
						message,
					})
				})
				.collect::<Result<Vec<Cell>>>()?;
			let column = if i == 0 {
				name.to_owned()
			} else {
				format!("{name}_{i}")
			};
			Ok(Column::new(column, values))
		})
		.collect()
}

fn rows_mismatch(name: &str) -> Error {
	Error::CalculationExecution {
		name: name.to_owned(),
		row: 0,
		message: "result does not match the table length".into(),
	}
}

pub struct Calculator<'a> {
	engine: &'a Engine,
	dataset: DatasetId,
}

impl<'a> Calculator<'a> {
	pub fn new(engine: &'a Engine, dataset: DatasetId) -> Self {
		Calculator { engine, dataset }
	}

	pub fn dataset(&self) -> &DatasetId {
		&self.dataset
	}

	fn store(&self) -> &'a dyn Store {
		&*self.engine.store
	}

	/// The stored table, internal columns included.
	fn frame(&self) -> Result<Frame> {
		self.store().dframe(&self.dataset, FrameOptions::complete())
	}

	/// Checks `formula` against a sample row and `group` against the
	/// dataset columns. Mutates nothing.
	pub fn validate(
		&self,
		formula: &str,
		group: Option<&GroupSpec>,
	) -> Result<Option<AggregationKind>> {
		let store = self.store();
		let meta = store.dataset(&self.dataset)?;
		// declared columns without values still resolve, as nulls
		let frame = store.dframe(&self.dataset, FrameOptions::padded().limit(1))?;
		let sample = frame.first_row().cloned().unwrap_or_default();

		let kind = self.engine.compiler.validate(formula, &meta.schema, &sample)?;

		if let Some(group) = group {
			for column in group.columns() {
				if !frame.has_column(column) && !meta.schema.contains(column) {
					return Err(Error::Formula(format!(
						"group `{column}` is not a column of dataset {}",
						self.dataset
					)));
				}
			}
		}
		Ok(kind)
	}

	/// Computes `formula` over the whole table and stores the result as
	/// column `name`, or as an aggregated dataset when the formula is an
	/// aggregation. Merged children get the new column afterwards, a child
	/// that fails is logged and skipped.
	///
	/// The column is written straight to the store, outside of any
	/// [`Worker`](crate::dispatch::Worker) lane. Callers must not run it while
	/// updates for the same dataset are in flight, the later write would
	/// drop the other's rows.
	#[tracing::instrument(skip_all, fields(dataset = %self.dataset, %name))]
	pub fn calculate_column(
		&self,
		formula: &str,
		name: &str,
		group: Option<GroupSpec>,
	) -> Result<()> {
		self.validate(formula, group.as_ref())?;

		let store = self.store();
		let meta = store.dataset(&self.dataset)?;
		let compiled = self.engine.compiler.compile(formula, &meta.schema)?;
		let frame = self.frame()?;
		let columns = apply(&compiled, &frame, name)?;

		match compiled.aggregation {
			Some(kind) => {
				let group = group.clone().unwrap_or_default();
				let aggregated =
					Aggregator::new(store, self.dataset.clone(), frame, group, kind, name)
						.save(columns)?;
				debug!(%aggregated, %kind, "stored aggregation");
			}
			None => {
				let column = columns.into_iter().next().ok_or_else(|| rows_mismatch(name))?;
				let updated = frame.join_column(column).ok_or_else(|| rows_mismatch(name))?;
				store.replace_observations(&self.dataset, updated)?;
				store.clear_summary_stats(&self.dataset)?;
			}
		}

		store.add_calculation(
			&self.dataset,
			Calculation {
				name: name.to_owned(),
				formula: formula.to_owned(),
				group,
			},
		)?;

		let mut visited = FxHashSet::default();
		visited.insert(self.dataset.clone());
		for child in store.dataset(&self.dataset)?.merged_datasets {
			if visited.contains(&child) {
				warn!(%child, "merged dataset already updated, skipping");
				continue;
			}
			let result = Calculator::new(self.engine, child.clone()).propagate(&self.dataset, &mut visited);
			if let Err(err) = result {
				error!(%child, %err, "column propagation failed");
			}
		}
		Ok(())
	}

	/// Replaces the rows this merged dataset holds from `parent` with the
	/// parent's full current table, then recurses into its own children.
	/// Failures below this dataset are logged, they do not fail the call.
	pub fn propagate_column(&self, parent: &DatasetId) -> Result<()> {
		let mut visited = FxHashSet::default();
		visited.insert(parent.clone());
		self.propagate(parent, &mut visited)
	}

	fn propagate(&self, parent: &DatasetId, visited: &mut FxHashSet<DatasetId>) -> Result<()> {
		visited.insert(self.dataset.clone());
		let store = self.store();

		store.remove_parent_observations(&self.dataset, parent)?;
		let remaining = store.dframe(&self.dataset, FrameOptions::complete())?;
		let parent_rows = store
			.dframe(parent, FrameOptions::default())?
			.with_parent(parent);
		store.replace_observations(&self.dataset, remaining.concat(parent_rows))?;
		store.clear_summary_stats(&self.dataset)?;
		debug!(dataset = %self.dataset, %parent, "propagated parent table");

		for child in store.dataset(&self.dataset)?.merged_datasets {
			if visited.contains(&child) {
				warn!(dataset = %self.dataset, %child, "merged dataset already updated, skipping");
				continue;
			}
			let result = Calculator::new(self.engine, child.clone()).propagate(&self.dataset, visited);
			if let Err(err) = result {
				error!(dataset = %self.dataset, %child, %err, "column propagation failed");
			}
		}
		Ok(())
	}

	/// Appends `update` to the dataset, computing every row calculation on
	/// the new rows only, then fans the change out to aggregated, merged
	/// and joined datasets.
	///
	/// Fails with [`Error::NotReady`] before touching anything while the
	/// dataset is being built, and with [`Error::NonUniqueJoin`] when the
	/// rows would break the key of a join this dataset is the lookup side
	/// of. Fan-out failures are logged and do not fail the update.
	#[tracing::instrument(skip_all, fields(dataset = %self.dataset, parent = ?parent))]
	pub fn calculate_updates(
		&self,
		update: &Update,
		parent: Option<&DatasetId>,
		trail: &Trail,
	) -> Result<()> {
		let store = self.store();
		let meta = store.dataset(&self.dataset)?;
		if !meta.is_ready() {
			return Err(Error::NotReady(self.dataset.clone()));
		}

		let existing = self.frame()?;
		let context = UpdateContext::build(store, &meta, &existing);

		let fresh = match update {
			Update::Rows(rows) => self.rows_to_frame(&meta.schema, &context, rows)?,
			Update::Compiled(frame) => frame.clone().drop_columns(is_internal_column),
		};
		if fresh.is_empty() {
			debug!("no rows to add");
			return Ok(());
		}

		self.check_joins(&meta, &existing, &fresh)?;

		let fresh = meta.schema.normalize_dates(fresh);
		let (fresh, deferred) = self.apply_calculations(&meta, &context, &existing, fresh)?;

		let tagged = match parent {
			Some(parent) => fresh.clone().with_parent(parent),
			None => fresh.clone(),
		};
		store.replace_observations(&self.dataset, existing.concat(tagged))?;
		store.clear_summary_stats(&self.dataset)?;
		debug!(rows = fresh.len(), "stored new rows");

		let trail = trail.with(&self.dataset);
		for calculation in &deferred {
			if let Err(err) = self.update_aggregation(&meta, &context, calculation, &fresh, &trail) {
				error!(calculation = %calculation.name, %err, "aggregation update failed");
			}
		}

		let rows = fresh.to_raw_rows();
		for edge in edges(&meta) {
			let target = edge.target();
			if trail.contains(target) {
				warn!(target_dataset = %target, "dataset already on this propagation, skipping");
				continue;
			}

			let result = match &edge {
				Edge::Merge(child) => {
					self.dispatch(UpdateTask {
						dataset: child.clone(),
						update: Update::Rows(rows.clone()),
						parent: Some(self.dataset.clone()),
						attempt: 0,
						trail: trail.clone(),
					});
					Ok(())
				}
				Edge::Join(link) => self.update_join(link, &fresh, &trail),
			};
			if let Err(err) = result {
				error!(target_dataset = %target, %err, "propagation branch failed");
			}
		}
		Ok(())
	}

	fn rows_to_frame(&self, schema: &Schema, context: &UpdateContext, rows: &[RawRow]) -> Result<Frame> {
		let mut frame = Frame::default();
		for raw in rows {
			let mut row = Row::new();
			for (key, value) in raw {
				if let Some(slug) = context.slug_for(key) {
					let cell = schema.convert_type(&slug, value)?;
					row.insert(slug, cell);
				}
			}
			frame.push_row(row);
		}
		Ok(frame)
	}

	/// Rejects rows that would repeat a join key of a join this dataset is
	/// the lookup side of, counting stored and new rows, nulls ignored. A
	/// key the other dataset already holds is allowed, it is what makes
	/// the join result recompute.
	fn check_joins(&self, meta: &Dataset, existing: &Frame, fresh: &Frame) -> Result<()> {
		let lookups = meta
			.joined_datasets
			.iter()
			.filter(|link| link.side == JoinSide::Left && fresh.has_column(&link.on));

		for link in lookups {
			let mut seen = FxHashSet::default();
			let unique = existing
				.values(&link.on)
				.chain(fresh.values(&link.on))
				.filter(|c| !c.is_null())
				.all(|c| seen.insert(c));
			if !unique {
				return Err(Error::NonUniqueJoin {
					dataset: self.dataset.clone(),
					on: link.on.clone(),
				});
			}
		}
		Ok(())
	}

	/// Adds every row calculation to `fresh`. Returns the calculations that
	/// target an aggregated dataset.
	fn apply_calculations(
		&self,
		meta: &Dataset,
		context: &UpdateContext,
		existing: &Frame,
		mut fresh: Frame,
	) -> Result<(Frame, Vec<Calculation>)> {
		let mut deferred = Vec::new();
		for calculation in &meta.calculations {
			let Some(target) = context.calculation_target(existing, &calculation.name) else {
				deferred.push(calculation.clone());
				continue;
			};
			let compiled = self
				.engine
				.compiler
				.compile(&calculation.formula, &meta.schema)?;
			let column = apply(&compiled, &fresh, &target)?
				.into_iter()
				.next()
				.ok_or_else(|| rows_mismatch(&target))?;
			fresh = fresh.join_column(column).ok_or_else(|| rows_mismatch(&target))?;
		}
		Ok((fresh, deferred))
	}

	/// Folds `fresh` into the aggregated dataset of `calculation` and sends
	/// the resulting table to that dataset's merged children.
	fn update_aggregation(
		&self,
		meta: &Dataset,
		context: &UpdateContext,
		calculation: &Calculation,
		fresh: &Frame,
		trail: &Trail,
	) -> Result<()> {
		let group = calculation.group.clone().unwrap_or_default();
		let Some(target) = context.aggregates.get(&group) else {
			warn!(calculation = %calculation.name, %group, "no aggregated dataset for calculation");
			return Ok(());
		};
		let aggregated = &target.meta.id;
		if trail.contains(aggregated) {
			warn!(%aggregated, "aggregated dataset already on this propagation, skipping");
			return Ok(());
		}

		let compiled = self
			.engine
			.compiler
			.compile(&calculation.formula, &meta.schema)?;
		let Some(kind) = compiled.aggregation else {
			warn!(calculation = %calculation.name, "calculation has no target column");
			return Ok(());
		};
		let slug = target
			.labels_to_slugs
			.get(&calculation.name)
			.cloned()
			.unwrap_or_else(|| calculation.name.clone());
		let columns = apply(&compiled, fresh, &slug)?;

		let updated = Aggregator::new(
			self.store(),
			self.dataset.clone(),
			fresh.clone(),
			group,
			kind,
			slug,
		)
		.update(aggregated, columns)?;
		debug!(%aggregated, groups = updated.len(), "updated aggregation");

		let rows = updated.to_raw_rows();
		let trail = trail.with(aggregated);
		for child in &target.meta.merged_datasets {
			if trail.contains(child) {
				warn!(%child, "merged dataset already on this propagation, skipping");
				continue;
			}
			if let Err(err) = self.store().remove_parent_observations(child, aggregated) {
				error!(%child, %err, "cannot reset merged rows of aggregation");
				continue;
			}
			self.dispatch(UpdateTask {
				dataset: child.clone(),
				update: Update::Rows(rows.clone()),
				parent: Some(aggregated.clone()),
				attempt: 0,
				trail: trail.clone(),
			});
		}
		Ok(())
	}

	fn update_join(&self, link: &JoinLink, fresh: &Frame, trail: &Trail) -> Result<()> {
		let store = self.store();
		match link.side {
			JoinSide::Left => {
				if !fresh.has_column(&link.on) {
					return Ok(());
				}
				let keys = fresh.distinct(&link.on);
				let rows = store.dframe(&link.other, FrameOptions::default())?;
				if !rows.values(&link.on).any(|key| keys.contains(key)) {
					return Ok(());
				}

				let lookup = store.dframe(&self.dataset, FrameOptions::default())?;
				store.replace_observations(&link.result, rows.join_frame(&lookup, &link.on))?;
				store.clear_summary_stats(&link.result)?;
				debug!(joined = %link.result, on = %link.on, "recomputed join");
			}
			JoinSide::Right => {
				let lookup = store.dframe(&link.other, FrameOptions::default())?;
				self.dispatch(UpdateTask {
					dataset: link.result.clone(),
					update: Update::Compiled(fresh.join_frame(&lookup, &link.on)),
					parent: None,
					attempt: 0,
					trail: trail.clone(),
				});
			}
		}
		Ok(())
	}

	fn dispatch(&self, task: UpdateTask) {
		debug!(target_dataset = %task.dataset, "dispatching update");
		self.engine.dispatcher.dispatch(task);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use serde_json::json;

	use super::*;
	use crate::dispatch::Queue;
	use crate::schema::ColumnType;
	use crate::store::MemoryStore;

	fn engine() -> (Arc<MemoryStore>, Arc<Queue>, Engine) {
		let store = MemoryStore::new();
		let queue = Queue::new();
		let engine = Engine::new(store.clone(), queue.clone());
		(store, queue, engine)
	}

	fn raw(pairs: &[(&str, serde_json::Value)]) -> RawRow {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.clone()))
			.collect()
	}

	#[test]
	fn unknown_group_column_is_a_formula_error() {
		let (store, _, engine) = engine();
		let id = store.create(
			Schema::new().with_column("a", ColumnType::Integer),
			Frame::from_raw(&[raw(&[("a", json!(1))])]),
		);

		let err = engine
			.calculator(id)
			.validate("sum(a)", Some(&GroupSpec::parse("missing")))
			.unwrap_err();
		assert!(matches!(err, Error::Formula(message) if message.contains("missing")));
	}

	#[test]
	fn validate_reports_aggregation_kind() {
		let (store, _, engine) = engine();
		let id = store.create(Schema::new(), Frame::default());
		let calculator = engine.calculator(id);

		assert_eq!(calculator.validate("1 + 2", None).unwrap(), None);
		assert_eq!(
			calculator.validate("max(3)", None).unwrap(),
			Some(AggregationKind::Max)
		);
	}

	#[test]
	fn labels_are_translated_and_unknown_columns_dropped() {
		let (store, _, engine) = engine();
		let schema = Schema::new().with_column("Total Amount", ColumnType::Integer);
		let id = store.create(schema, Frame::default());

		engine
			.update(
				&id,
				Update::from(raw(&[("Total Amount", json!("7")), ("noise", json!(1))])),
			)
			.unwrap();

		let frame = store.dframe(&id, FrameOptions::default()).unwrap();
		assert_eq!(frame.columns(), &["total_amount".to_string()]);
		assert_eq!(frame.rows()[0]["total_amount"], Cell::Int(7));
	}

	#[test]
	fn empty_dataset_accepts_every_column() {
		let (store, _, engine) = engine();
		let id = store.create(Schema::new(), Frame::default());

		engine
			.update(&id, Update::from(raw(&[("Some Label", json!(2.5))])))
			.unwrap();

		let frame = store.dframe(&id, FrameOptions::default()).unwrap();
		assert_eq!(frame.rows()[0]["some_label"], Cell::Float(2.5));
		assert!(store.dataset(&id).unwrap().schema.contains("some_label"));
	}

	#[test]
	fn failing_row_function_persists_nothing() {
		let (store, _, engine) = engine();
		let frame = Frame::from_raw(&[raw(&[("a", json!(1)), ("t", json!("x"))])]);
		let id = store.create(Schema::from_frame(&frame), frame);
		let version = store.version(&id).unwrap();

		let err = engine
			.calculator(id.clone())
			.calculate_column("a * t", "bad", None)
			.unwrap_err();
		assert!(matches!(err, Error::Formula(_) | Error::CalculationExecution { .. }));
		assert_eq!(store.version(&id).unwrap(), version);
		assert!(store.dataset(&id).unwrap().calculations.is_empty());
	}
}
