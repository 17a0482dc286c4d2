//! In-memory tables.
//!
//! A [`Frame`] keeps an ordered list of columns and rows keyed by column
//! name. Every row carries every column, absent values are [`Cell::Null`].

use std::collections::BTreeMap;

use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::cell::Cell;
use crate::dataset::DatasetId;

pub type Row = BTreeMap<String, Cell>;

/// Row shape crossing the asynchronous boundary and accepted from callers.
pub type RawRow = BTreeMap<String, Json>;

/// Merge provenance column.
pub const PARENT_ID: &str = "_parent_dataset_id";

/// Prefix of the columns where aggregations keep their running state.
pub const STATE_PREFIX: &str = "_agg_";

pub fn is_state_column(name: &str) -> bool {
	name.starts_with(STATE_PREFIX)
}

pub fn is_internal_column(name: &str) -> bool {
	name == PARENT_ID || is_state_column(name)
}

/// A named list of values, one per frame row.
#[derive(Clone, Debug, PartialEq)]
pub struct Column {
	pub name: String,
	pub values: Vec<Cell>,
}

impl Column {
	pub fn new(name: impl Into<String>, values: Vec<Cell>) -> Self {
		Column {
			name: name.into(),
			values,
		}
	}

	pub fn len(&self) -> usize {
		self.values.len()
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
	columns: Vec<String>,
	rows: Vec<Row>,
}

impl Frame {
	pub fn new(columns: Vec<String>) -> Self {
		Frame {
			columns,
			rows: Vec::new(),
		}
	}

	pub fn from_rows(rows: Vec<Row>) -> Self {
		let mut frame = Frame::default();
		for row in rows {
			frame.push_row(row);
		}
		frame
	}

	/// Builds a frame without any schema, inferring cells from JSON.
	pub fn from_raw(rows: &[RawRow]) -> Self {
		Frame::from_rows(
			rows.iter()
				.map(|raw| {
					raw.iter()
						.map(|(k, v)| (k.clone(), Cell::from_json(v)))
						.collect()
				})
				.collect(),
		)
	}

	pub fn columns(&self) -> &[String] {
		&self.columns
	}

	pub fn rows(&self) -> &[Row] {
		&self.rows
	}

	/// Cells may be rewritten in place, the column set must not change.
	pub fn rows_mut(&mut self) -> &mut [Row] {
		&mut self.rows
	}

	pub fn into_rows(self) -> Vec<Row> {
		self.rows
	}

	pub fn len(&self) -> usize {
		self.rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	pub fn has_column(&self, name: &str) -> bool {
		self.columns.iter().any(|c| c == name)
	}

	pub fn first_row(&self) -> Option<&Row> {
		self.rows.first()
	}

	pub fn push_row(&mut self, mut row: Row) {
		for name in row.keys() {
			if !self.has_column(name) {
				self.columns.push(name.clone());
				for existing in self.rows.iter_mut() {
					existing.insert(name.clone(), Cell::Null);
				}
			}
		}
		for name in &self.columns {
			row.entry(name.clone()).or_insert(Cell::Null);
		}
		self.rows.push(row);
	}

	pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Cell> + 'a {
		self.rows.iter().map(move |row| row.get(name).unwrap_or(&Cell::Null))
	}

	/// Adds `column` or overwrites the column of the same name.
	pub fn join_column(mut self, column: Column) -> Option<Frame> {
		if column.len() != self.rows.len() {
			return None;
		}
		if !self.has_column(&column.name) {
			self.columns.push(column.name.clone());
		}
		for (row, value) in self.rows.iter_mut().zip(column.values) {
			row.insert(column.name.clone(), value);
		}
		Some(self)
	}

	/// Union of both row sets, columns of either side are kept.
	pub fn concat(mut self, other: Frame) -> Frame {
		for name in &other.columns {
			if !self.has_column(name) {
				self.columns.push(name.clone());
				for row in self.rows.iter_mut() {
					row.insert(name.clone(), Cell::Null);
				}
			}
		}
		for mut row in other.rows {
			for name in &self.columns {
				row.entry(name.clone()).or_insert(Cell::Null);
			}
			self.rows.push(row);
		}
		self
	}

	pub fn with_parent(mut self, parent: &DatasetId) -> Frame {
		let tag = Cell::Text(parent.to_string());
		if !self.has_column(PARENT_ID) {
			self.columns.push(PARENT_ID.to_owned());
		}
		for row in self.rows.iter_mut() {
			row.insert(PARENT_ID.to_owned(), tag.clone());
		}
		self
	}

	pub fn retain_rows(&mut self, mut keep: impl FnMut(&Row) -> bool) {
		self.rows.retain(|row| keep(row));
	}

	/// Rows that did not originate from `parent`.
	pub fn without_parent(mut self, parent: &DatasetId) -> Frame {
		let tag = Cell::Text(parent.to_string());
		self.retain_rows(|row| row.get(PARENT_ID) != Some(&tag));
		self
	}

	pub fn drop_columns(mut self, mut drop: impl FnMut(&str) -> bool) -> Frame {
		let dropped: Vec<String> = self
			.columns
			.iter()
			.filter(|c| drop(c.as_str()))
			.cloned()
			.collect();
		if dropped.is_empty() {
			return self;
		}
		self.columns.retain(|c| !dropped.contains(c));
		for row in self.rows.iter_mut() {
			for name in &dropped {
				row.remove(name);
			}
		}
		self
	}

	/// Adds each of `columns` that is missing, filled with nulls.
	pub fn pad(mut self, columns: &[String]) -> Frame {
		for name in columns {
			if !self.has_column(name) {
				self.columns.push(name.clone());
				for row in self.rows.iter_mut() {
					row.insert(name.clone(), Cell::Null);
				}
			}
		}
		self
	}

	pub fn truncate(mut self, limit: usize) -> Frame {
		self.rows.truncate(limit);
		self
	}

	pub fn distinct(&self, name: &str) -> FxHashSet<Cell> {
		self.values(name).filter(|c| !c.is_null()).cloned().collect()
	}

	/// Whether the non-null values of `name` are pairwise distinct.
	pub fn is_unique(&self, name: &str) -> bool {
		let mut seen = FxHashSet::default();
		self.values(name)
			.filter(|c| !c.is_null())
			.all(|c| seen.insert(c.clone()))
	}

	/// Left join of `self` with `lookup` on column `on`.
	///
	/// `lookup` is expected to be unique on `on`, the first matching row
	/// wins otherwise. Lookup columns already present on the left are
	/// skipped.
	pub fn join_frame(&self, lookup: &Frame, on: &str) -> Frame {
		let mut index: FxHashMap<&Cell, &Row> = FxHashMap::default();
		for row in lookup.rows.iter() {
			if let Some(key) = row.get(on).filter(|k| !k.is_null()) {
				index.entry(key).or_insert(row);
			}
		}

		let extra: Vec<&String> = lookup
			.columns
			.iter()
			.filter(|c| c.as_str() != on && !is_internal_column(c) && !self.has_column(c))
			.collect();

		let mut frame = Frame::new(self.columns.clone());
		frame.columns.extend(extra.iter().map(|c| (*c).clone()));
		for row in self.rows.iter() {
			let mut joined = row.clone();
			let matched = row.get(on).and_then(|key| index.get(key));
			for name in &extra {
				let value = matched
					.and_then(|m| m.get(name.as_str()))
					.cloned()
					.unwrap_or_default();
				joined.insert((*name).clone(), value);
			}
			frame.rows.push(joined);
		}
		frame
	}

	/// Visible rows as JSON, internal columns removed.
	pub fn to_raw_rows(&self) -> Vec<RawRow> {
		self.rows
			.iter()
			.map(|row| {
				row.iter()
					.filter(|(k, _)| !is_internal_column(k))
					.map(|(k, v)| (k.clone(), v.to_json()))
					.collect()
			})
			.collect()
	}
}
