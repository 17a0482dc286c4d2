//! Descriptive statistics cached per dataset.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::aggregation::{Accumulator, AggregationKind};
use crate::cell::Cell;
use crate::dataset::GroupSpec;
use crate::frame::{is_internal_column, Frame};
use crate::schema::{ColumnType, Schema};

pub type SummaryStats = BTreeMap<String, ColumnSummary>;

/// Column sums per group, keyed by the group values joined with `,`.
pub type GroupedStats = BTreeMap<String, BTreeMap<String, Cell>>;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnSummary {
	Numeric {
		count: usize,
		sum: f64,
		mean: Option<f64>,
		min: Option<f64>,
		max: Option<f64>,
	},
	/// Value counts, nulls excluded.
	Categorical { counts: BTreeMap<String, usize> },
}

pub fn summarize(schema: &Schema, frame: &Frame) -> SummaryStats {
	let mut stats = SummaryStats::new();
	for name in frame.columns().iter().filter(|c| !is_internal_column(c)) {
		let numeric = matches!(
			schema.get(name).map(|c| c.kind),
			Some(ColumnType::Integer | ColumnType::Float)
		);

		let summary = if numeric {
			let values: Vec<f64> = frame.values(name).filter_map(|c| c.as_f64()).collect();
			let sum: f64 = values.iter().sum();
			ColumnSummary::Numeric {
				count: values.len(),
				sum,
				mean: (!values.is_empty()).then(|| sum / values.len() as f64),
				min: values.iter().copied().reduce(f64::min),
				max: values.iter().copied().reduce(f64::max),
			}
		} else {
			let mut counts = BTreeMap::new();
			for cell in frame.values(name).filter(|c| !c.is_null()) {
				*counts.entry(cell.to_string()).or_insert(0) += 1;
			}
			ColumnSummary::Categorical { counts }
		};
		stats.insert(name.clone(), summary);
	}
	stats
}

/// Sums every numeric column that is not part of `group`, one entry per
/// distinct group value.
pub fn summarize_grouped(schema: &Schema, frame: &Frame, group: &GroupSpec) -> GroupedStats {
	let columns: Vec<&String> = frame
		.columns()
		.iter()
		.filter(|c| !is_internal_column(c) && !group.columns().contains(c))
		.filter(|c| {
			matches!(
				schema.get(c).map(|c| c.kind),
				Some(ColumnType::Integer | ColumnType::Float)
			)
		})
		.collect();

	let mut sums: BTreeMap<String, Vec<Accumulator>> = BTreeMap::new();
	for row in frame.rows() {
		let key = group
			.columns()
			.iter()
			.map(|c| row.get(c).cloned().unwrap_or_default().to_string())
			.collect::<Vec<_>>()
			.join(",");
		let accumulators = sums
			.entry(key)
			.or_insert_with(|| vec![Accumulator::new(AggregationKind::Sum); columns.len()]);
		for (acc, column) in accumulators.iter_mut().zip(&columns) {
			acc.push(row.get(column.as_str()).unwrap_or(&Cell::Null));
		}
	}

	sums.into_iter()
		.map(|(key, accumulators)| {
			let totals = columns
				.iter()
				.zip(accumulators)
				.map(|(column, acc)| ((*column).clone(), acc.value()))
				.collect();
			(key, totals)
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::frame::Row;

	#[test]
	fn numeric_and_categorical_columns() {
		let schema = Schema::new()
			.with_column("a", ColumnType::Integer)
			.with_column("g", ColumnType::Text);
		let rows = [(1, "x"), (3, "x"), (5, "y")]
			.into_iter()
			.map(|(a, g)| {
				let mut row = Row::new();
				row.insert("a".into(), Cell::Int(a));
				row.insert("g".into(), Cell::from(g));
				row
			})
			.collect();

		let stats = summarize(&schema, &Frame::from_rows(rows));
		assert_eq!(
			stats["a"],
			ColumnSummary::Numeric {
				count: 3,
				sum: 9.0,
				mean: Some(3.0),
				min: Some(1.0),
				max: Some(5.0),
			}
		);
		match &stats["g"] {
			ColumnSummary::Categorical { counts } => {
				assert_eq!(counts["x"], 2);
				assert_eq!(counts["y"], 1);
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test]
	fn grouped_sums_skip_text_and_group_columns() {
		let schema = Schema::new()
			.with_column("g", ColumnType::Text)
			.with_column("a", ColumnType::Integer)
			.with_column("b", ColumnType::Float)
			.with_column("t", ColumnType::Text);
		let rows = [("x", 1, 0.5), ("x", 2, 1.0), ("y", 4, 2.0)]
			.into_iter()
			.map(|(g, a, b)| {
				let mut row = Row::new();
				row.insert("g".into(), Cell::from(g));
				row.insert("a".into(), Cell::Int(a));
				row.insert("b".into(), Cell::Float(b));
				row.insert("t".into(), Cell::from("text"));
				row
			})
			.collect();

		let grouped = summarize_grouped(&schema, &Frame::from_rows(rows), &GroupSpec::parse("g"));
		assert_eq!(grouped.len(), 2);
		assert_eq!(grouped["x"]["a"], Cell::Int(3));
		assert_eq!(grouped["x"]["b"], Cell::Float(1.5));
		assert_eq!(grouped["y"]["a"], Cell::Int(4));
		assert!(!grouped["x"].contains_key("t"));
		assert!(!grouped["x"].contains_key("g"));
	}
}
