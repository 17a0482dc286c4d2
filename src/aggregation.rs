//! Aggregation kinds and the accumulators that fold rows into groups.
//!
//! An accumulator can be restored from a stored aggregation row, so new
//! rows fold into existing results without rereading history. Mean keeps
//! its running sum and count in state columns next to the visible value.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::cell::Cell;
use crate::frame::{Row, STATE_PREFIX};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
	Sum,
	Count,
	Min,
	Max,
	Mean,
}

impl AggregationKind {
	pub fn from_name(name: &str) -> Option<Self> {
		match name.to_ascii_lowercase().as_str() {
			"sum" => Some(AggregationKind::Sum),
			"count" => Some(AggregationKind::Count),
			"min" => Some(AggregationKind::Min),
			"max" => Some(AggregationKind::Max),
			"mean" | "avg" => Some(AggregationKind::Mean),
			_ => None,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			AggregationKind::Sum => "sum",
			AggregationKind::Count => "count",
			AggregationKind::Min => "min",
			AggregationKind::Max => "max",
			AggregationKind::Mean => "mean",
		}
	}

	/// Hidden columns the aggregation needs to be updated incrementally.
	pub fn state_columns(self, column: &str) -> SmallVec<[String; 2]> {
		match self {
			AggregationKind::Mean => smallvec![sum_column(column), count_column(column)],
			_ => SmallVec::new(),
		}
	}
}

impl fmt::Display for AggregationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

fn sum_column(column: &str) -> String {
	format!("{STATE_PREFIX}sum_{column}")
}

fn count_column(column: &str) -> String {
	format!("{STATE_PREFIX}count_{column}")
}

fn add(a: &Cell, b: &Cell) -> Cell {
	match (a, b) {
		(Cell::Int(x), Cell::Int(y)) => match x.checked_add(*y) {
			Some(sum) => Cell::Int(sum),
			None => Cell::Float(*x as f64 + *y as f64),
		},
		_ => match (a.as_f64(), b.as_f64()) {
			(Some(x), Some(y)) => Cell::Float(x + y),
			_ => a.clone(),
		},
	}
}

#[derive(Clone, Debug, PartialEq)]
pub enum Accumulator {
	Sum(Option<Cell>),
	Count(i64),
	Min(Option<Cell>),
	Max(Option<Cell>),
	Mean { sum: f64, count: i64 },
}

impl Accumulator {
	pub fn new(kind: AggregationKind) -> Self {
		match kind {
			AggregationKind::Sum => Accumulator::Sum(None),
			AggregationKind::Count => Accumulator::Count(0),
			AggregationKind::Min => Accumulator::Min(None),
			AggregationKind::Max => Accumulator::Max(None),
			AggregationKind::Mean => Accumulator::Mean { sum: 0.0, count: 0 },
		}
	}

	/// Rebuilds the accumulator stored under `column` of an aggregation row.
	pub fn restore(kind: AggregationKind, row: &Row, column: &str) -> Self {
		let value = row.get(column).filter(|c| !c.is_null()).cloned();
		match kind {
			AggregationKind::Sum => Accumulator::Sum(value),
			AggregationKind::Count => {
				Accumulator::Count(value.and_then(|c| c.as_i64()).unwrap_or(0))
			}
			AggregationKind::Min => Accumulator::Min(value),
			AggregationKind::Max => Accumulator::Max(value),
			AggregationKind::Mean => Accumulator::Mean {
				sum: row
					.get(&sum_column(column))
					.and_then(Cell::as_f64)
					.unwrap_or(0.0),
				count: row
					.get(&count_column(column))
					.and_then(Cell::as_i64)
					.unwrap_or(0),
			},
		}
	}

	/// Folds one value in. Nulls are skipped, non-numeric values are
	/// skipped by the numeric aggregations.
	pub fn push(&mut self, value: &Cell) {
		if value.is_null() {
			return;
		}
		match self {
			Accumulator::Sum(total) => {
				if value.is_numeric() {
					*total = Some(match total {
						Some(current) => add(current, value),
						None => value.clone(),
					});
				}
			}
			Accumulator::Count(count) => *count += 1,
			Accumulator::Min(min) => {
				if min.as_ref().map_or(true, |m| value < m) {
					*min = Some(value.clone());
				}
			}
			Accumulator::Max(max) => {
				if max.as_ref().map_or(true, |m| value > m) {
					*max = Some(value.clone());
				}
			}
			Accumulator::Mean { sum, count } => {
				if let Some(v) = value.as_f64().filter(|_| value.is_numeric()) {
					*sum += v;
					*count += 1;
				}
			}
		}
	}

	/// Combines two partial results of the same kind.
	pub fn merge(&mut self, other: Accumulator) {
		match (self, other) {
			(Accumulator::Sum(a), Accumulator::Sum(b)) => {
				*a = match (a.take(), b) {
					(Some(x), Some(y)) => Some(add(&x, &y)),
					(x, y) => x.or(y),
				}
			}
			(Accumulator::Count(a), Accumulator::Count(b)) => *a += b,
			(Accumulator::Min(a), Accumulator::Min(Some(b))) => {
				if a.as_ref().map_or(true, |m| &b < m) {
					*a = Some(b);
				}
			}
			(Accumulator::Max(a), Accumulator::Max(Some(b))) => {
				if a.as_ref().map_or(true, |m| &b > m) {
					*a = Some(b);
				}
			}
			(Accumulator::Mean { sum, count }, Accumulator::Mean { sum: s, count: c }) => {
				*sum += s;
				*count += c;
			}
			_ => {}
		}
	}

	pub fn value(&self) -> Cell {
		match self {
			Accumulator::Sum(total) => total.clone().unwrap_or(Cell::Int(0)),
			Accumulator::Count(count) => Cell::Int(*count),
			Accumulator::Min(v) | Accumulator::Max(v) => v.clone().unwrap_or_default(),
			Accumulator::Mean { sum, count } => {
				if *count == 0 {
					Cell::Null
				} else {
					Cell::Float(*sum / *count as f64)
				}
			}
		}
	}

	/// Writes the visible value and any state columns into `row`.
	pub fn write(&self, row: &mut Row, column: &str) {
		row.insert(column.to_owned(), self.value());
		if let Accumulator::Mean { sum, count } = self {
			row.insert(sum_column(column), Cell::Float(*sum));
			row.insert(count_column(column), Cell::Int(*count));
		}
	}
}
