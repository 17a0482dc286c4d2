//! Relationships between datasets as typed edges, walked by id.
//!
//! The store does not forbid cycles (a dataset merged into its own
//! ancestor, an aggregation merged back into its source). Every propagation
//! run carries a [`Trail`] of the datasets it already touched and never
//! re-enters one of them.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::dataset::{Dataset, DatasetId, JoinLink};

/// A dataset fed by row updates of its parent. Aggregated datasets are not
/// edges, they are reached through the calculations that produce them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Edge {
	Merge(DatasetId),
	Join(JoinLink),
}

impl Edge {
	pub fn target(&self) -> &DatasetId {
		match self {
			Edge::Merge(child) => child,
			Edge::Join(link) => &link.result,
		}
	}
}

/// Outgoing edges of `dataset`: merges, then joins.
pub fn edges(dataset: &Dataset) -> SmallVec<[Edge; 4]> {
	let mut edges = SmallVec::new();
	edges.extend(dataset.merged_datasets.iter().cloned().map(Edge::Merge));
	edges.extend(dataset.joined_datasets.iter().cloned().map(Edge::Join));
	edges
}

/// Datasets already updated by one propagation run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trail {
	visited: SmallVec<[DatasetId; 4]>,
}

impl Trail {
	pub fn new() -> Self {
		Trail::default()
	}

	pub fn contains(&self, id: &DatasetId) -> bool {
		self.visited.contains(id)
	}

	pub fn with(&self, id: &DatasetId) -> Trail {
		let mut next = self.clone();
		if !next.contains(id) {
			next.visited.push(id.clone());
		}
		next
	}

	pub fn len(&self) -> usize {
		self.visited.len()
	}

	pub fn is_empty(&self) -> bool {
		self.visited.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dataset::JoinSide;
	use crate::schema::Schema;

	#[test]
	fn edges_list_merges_before_joins() {
		let mut meta = Dataset::new(DatasetId::from("a"), Schema::new());
		let link = JoinLink {
			side: JoinSide::Right,
			other: DatasetId::from("lookup"),
			on: "k".into(),
			result: DatasetId::from("joined"),
		};
		meta.joined_datasets.push(link.clone());
		meta.merged_datasets.push(DatasetId::from("m"));

		let found = edges(&meta);
		let targets: Vec<&DatasetId> = found.iter().map(Edge::target).collect();
		assert_eq!(targets, vec![&DatasetId::from("m"), &DatasetId::from("joined")]);
		assert_eq!(found[1], Edge::Join(link));
	}

	#[test]
	fn trail_records_each_dataset_once() {
		let id = DatasetId::from("a");
		let trail = Trail::new().with(&id).with(&id);
		assert_eq!(trail.len(), 1);
		assert!(trail.contains(&id));
	}
}
