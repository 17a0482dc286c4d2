use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::schema::Schema;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
	pub fn generate() -> Self {
		DatasetId(uuid::Uuid::new_v4().simple().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for DatasetId {
	fn from(value: &str) -> Self {
		DatasetId(value.to_owned())
	}
}

impl From<String> for DatasetId {
	fn from(value: String) -> Self {
		DatasetId(value)
	}
}

impl fmt::Display for DatasetId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Columns an aggregation is grouped by. Empty means the whole table is one
/// group.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupSpec {
	columns: SmallVec<[String; 2]>,
}

impl GroupSpec {
	pub const ALL: &'static str = "all";

	pub fn all() -> Self {
		GroupSpec::default()
	}

	/// Parses a comma separated list of column names.
	pub fn parse(spec: &str) -> Self {
		let columns = spec
			.split(',')
			.map(str::trim)
			.filter(|c| !c.is_empty())
			.map(str::to_owned)
			.collect::<SmallVec<[String; 2]>>();
		if columns.len() == 1 && columns[0] == Self::ALL {
			return GroupSpec::all();
		}
		GroupSpec { columns }
	}

	pub fn columns(&self) -> &[String] {
		&self.columns
	}

	pub fn is_all(&self) -> bool {
		self.columns.is_empty()
	}
}

impl From<&str> for GroupSpec {
	fn from(value: &str) -> Self {
		GroupSpec::parse(value)
	}
}

impl fmt::Display for GroupSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_all() {
			f.write_str(Self::ALL)
		} else {
			f.write_str(&self.columns.join(","))
		}
	}
}

/// A named formula attached to a dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calculation {
	pub name: String,
	pub formula: String,
	pub group: Option<GroupSpec>,
}

impl Calculation {
	pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
		Calculation {
			name: name.into(),
			formula: formula.into(),
			group: None,
		}
	}

	pub fn grouped(mut self, group: GroupSpec) -> Self {
		self.group = Some(group);
		self
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinSide {
	/// This dataset provides the unique join key, the other dataset's rows
	/// are looked up against it.
	Left,
	/// This dataset's rows are joined onto the other (left) dataset.
	Right,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinLink {
	pub side: JoinSide,
	pub other: DatasetId,
	pub on: String,
	pub result: DatasetId,
}

/// Metadata of a dataset, without its observations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
	pub id: DatasetId,
	pub schema: Schema,
	pub calculations: Vec<Calculation>,
	pub ready: bool,
	pub num_rows: usize,
	pub num_columns: usize,
	pub merged_datasets: Vec<DatasetId>,
	pub joined_datasets: Vec<JoinLink>,
	pub aggregated_datasets: BTreeMap<GroupSpec, DatasetId>,
}

impl Dataset {
	pub fn new(id: DatasetId, schema: Schema) -> Self {
		Dataset {
			id,
			num_columns: schema.len(),
			schema,
			calculations: Vec::new(),
			ready: true,
			num_rows: 0,
			merged_datasets: Vec::new(),
			joined_datasets: Vec::new(),
			aggregated_datasets: BTreeMap::new(),
		}
	}

	pub fn is_ready(&self) -> bool {
		self.ready
	}
}
