use chrono::{DateTime, NaiveDate, NaiveDateTime};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::cell::{Cell, DATE_FORMAT};
use crate::error::{Error, Result};
use crate::frame::{is_internal_column, Frame};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
	Integer,
	Float,
	Boolean,
	Text,
	Date,
}

impl ColumnType {
	pub fn infer(cell: &Cell) -> Option<ColumnType> {
		match cell {
			Cell::Null => None,
			Cell::Bool(_) => Some(ColumnType::Boolean),
			Cell::Int(_) => Some(ColumnType::Integer),
			Cell::Float(_) => Some(ColumnType::Float),
			Cell::Date(_) => Some(ColumnType::Date),
			Cell::Text(_) => Some(ColumnType::Text),
		}
	}

	fn widen(self, other: ColumnType) -> ColumnType {
		use ColumnType::*;
		match (self, other) {
			(a, b) if a == b => a,
			(Integer, Float) | (Float, Integer) => Float,
			_ => Text,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSchema {
	pub label: String,
	pub kind: ColumnType,
}

/// Ordered mapping of column slug to its label and type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
	columns: Vec<(String, ColumnSchema)>,
}

pub fn slugify(label: &str) -> String {
	let slug: String = label
		.trim()
		.chars()
		.map(|c| {
			if c.is_alphanumeric() {
				c.to_ascii_lowercase()
			} else {
				'_'
			}
		})
		.collect();
	if slug.is_empty() {
		"_".to_owned()
	} else {
		slug
	}
}

impl Schema {
	pub fn new() -> Self {
		Schema::default()
	}

	pub fn with_column(mut self, label: &str, kind: ColumnType) -> Self {
		self.insert(label, kind);
		self
	}

	/// Adds a column labelled `label`, returns its slug. Slugs stay unique,
	/// a colliding slug gets a numeric suffix.
	pub fn insert(&mut self, label: &str, kind: ColumnType) -> String {
		if let Some(slug) = self.slug_for(label) {
			return slug.to_owned();
		}

		let base = slugify(label);
		let mut slug = base.clone();
		let mut n = 1;
		while self.get(&slug).is_some() {
			slug = format!("{base}_{n}");
			n += 1;
		}

		self.columns.push((
			slug.clone(),
			ColumnSchema {
				label: label.to_owned(),
				kind,
			},
		));
		slug
	}

	/// Adds a column under an existing slug, keeping the first definition.
	pub fn insert_slug(&mut self, slug: &str, column: ColumnSchema) {
		if !self.contains(slug) {
			self.columns.push((slug.to_owned(), column));
		}
	}

	pub fn is_empty(&self) -> bool {
		self.columns.is_empty()
	}

	pub fn len(&self) -> usize {
		self.columns.len()
	}

	pub fn get(&self, slug: &str) -> Option<&ColumnSchema> {
		self.columns.iter().find(|(s, _)| s == slug).map(|(_, c)| c)
	}

	pub fn contains(&self, slug: &str) -> bool {
		self.get(slug).is_some()
	}

	pub fn slugs(&self) -> impl Iterator<Item = &String> {
		self.columns.iter().map(|(s, _)| s)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &ColumnSchema)> {
		self.columns.iter().map(|(s, c)| (s, c))
	}

	fn slug_for(&self, label: &str) -> Option<&str> {
		self.columns
			.iter()
			.find(|(_, c)| c.label == label)
			.map(|(s, _)| s.as_str())
	}

	/// Label and slug both resolve to the slug.
	pub fn labels_to_slugs(&self) -> FxHashMap<String, String> {
		let mut map = FxHashMap::default();
		for (slug, _) in &self.columns {
			map.insert(slug.clone(), slug.clone());
		}
		// labels win over an identical slug of another column
		for (slug, column) in &self.columns {
			map.insert(column.label.clone(), slug.clone());
		}
		map
	}

	/// Converts `value` according to the declared type of `slug`.
	///
	/// Dates are left as text here, [`Schema::normalize_dates`] parses them.
	pub fn convert_type(&self, slug: &str, value: &Json) -> Result<Cell> {
		let Some(column) = self.get(slug) else {
			return Ok(Cell::from_json(value));
		};

		let fail = || Error::Conversion {
			column: slug.to_owned(),
			value: value.to_string(),
		};

		let cell = match (column.kind, value) {
			(_, Json::Null) => Cell::Null,
			(ColumnType::Integer, Json::Number(n)) => match n.as_i64() {
				Some(i) => Cell::Int(i),
				None => Cell::Float(n.as_f64().ok_or_else(fail)?),
			},
			(ColumnType::Integer, Json::String(s)) => {
				let s = s.trim();
				if s.is_empty() {
					Cell::Null
				} else if let Ok(i) = s.parse::<i64>() {
					Cell::Int(i)
				} else {
					Cell::Float(s.parse::<f64>().map_err(|_| fail())?)
				}
			}
			(ColumnType::Float, Json::Number(n)) => Cell::Float(n.as_f64().ok_or_else(fail)?),
			(ColumnType::Float, Json::String(s)) => {
				let s = s.trim();
				if s.is_empty() {
					Cell::Null
				} else {
					Cell::Float(s.parse::<f64>().map_err(|_| fail())?)
				}
			}
			(ColumnType::Boolean, Json::Bool(b)) => Cell::Bool(*b),
			(ColumnType::Boolean, Json::String(s)) => match s.trim().to_lowercase().as_str() {
				"true" | "yes" | "1" => Cell::Bool(true),
				"false" | "no" | "0" => Cell::Bool(false),
				"" => Cell::Null,
				_ => return Err(fail()),
			},
			(ColumnType::Boolean, Json::Number(n)) => Cell::Bool(n.as_f64() != Some(0.0)),
			(ColumnType::Text | ColumnType::Date, Json::String(s)) => Cell::Text(s.clone()),
			(ColumnType::Text | ColumnType::Date, other) => Cell::Text(other.to_string()),
			_ => return Err(fail()),
		};
		Ok(cell)
	}

	/// Parses text cells of date typed columns.
	pub fn normalize_dates(&self, mut frame: Frame) -> Frame {
		let dates: Vec<&String> = self
			.columns
			.iter()
			.filter(|(s, c)| c.kind == ColumnType::Date && frame.has_column(s))
			.map(|(s, _)| s)
			.collect();

		for row in frame.rows_mut() {
			for slug in &dates {
				let Some(cell) = row.get_mut(slug.as_str()) else {
					continue;
				};
				if let Some(date) = cell_date(cell) {
					*cell = Cell::Date(date);
				}
			}
		}
		frame
	}

	/// Registers every visible column of `frame` that the schema lacks, with
	/// a type inferred from its values. A column holding nothing but nulls
	/// waits for its first value. Returns whether the schema changed.
	pub fn extend_from(&mut self, frame: &Frame) -> bool {
		let mut changed = false;
		for name in frame.columns() {
			if is_internal_column(name) || self.contains(name) {
				continue;
			}
			let Some(kind) = frame
				.values(name)
				.filter_map(ColumnType::infer)
				.reduce(ColumnType::widen)
			else {
				continue;
			};
			self.columns.push((
				name.clone(),
				ColumnSchema {
					label: name.clone(),
					kind,
				},
			));
			changed = true;
		}
		changed
	}

	pub fn from_frame(frame: &Frame) -> Schema {
		let mut schema = Schema::new();
		schema.extend_from(frame);
		schema
	}
}

fn cell_date(cell: &Cell) -> Option<NaiveDate> {
	match cell {
		Cell::Text(text) => parse_date(text),
		_ => None,
	}
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
	let text = text.trim();
	NaiveDate::parse_from_str(text, DATE_FORMAT)
		.ok()
		.or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|d| d.date_naive()))
		.or_else(|| {
			NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
				.ok()
				.map(|d| d.date())
		})
		.or_else(|| NaiveDate::parse_from_str(text, "%m/%d/%Y").ok())
}
