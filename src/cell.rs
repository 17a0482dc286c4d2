use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single scalar stored in a frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
	#[default]
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Date(NaiveDate),
	Text(String),
}

impl Cell {
	pub fn is_null(&self) -> bool {
		match self {
			Cell::Null => true,
			Cell::Float(f) => f.is_nan(),
			_ => false,
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Cell::Int(i) => Some(*i as f64),
			Cell::Float(f) => Some(*f),
			Cell::Bool(b) => Some(*b as i64 as f64),
			_ => None,
		}
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Cell::Int(i) => Some(*i),
			Cell::Float(f) if f.fract() == 0.0 => Some(*f as i64),
			Cell::Bool(b) => Some(*b as i64),
			_ => None,
		}
	}

	pub fn is_numeric(&self) -> bool {
		matches!(self, Cell::Int(_) | Cell::Float(_))
	}

	/// Untyped conversion used when no schema type is known yet.
	pub fn from_json(value: &Json) -> Cell {
		match value {
			Json::Null => Cell::Null,
			Json::Bool(b) => Cell::Bool(*b),
			Json::Number(n) => match n.as_i64() {
				Some(i) => Cell::Int(i),
				None => n.as_f64().map(Cell::Float).unwrap_or(Cell::Null),
			},
			Json::String(s) => Cell::Text(s.clone()),
			other => Cell::Text(other.to_string()),
		}
	}

	pub fn to_json(&self) -> Json {
		match self {
			Cell::Null => Json::Null,
			Cell::Bool(b) => Json::Bool(*b),
			Cell::Int(i) => Json::from(*i),
			Cell::Float(f) => serde_json::Number::from_f64(*f)
				.map(Json::Number)
				.unwrap_or(Json::Null),
			Cell::Date(d) => Json::String(d.format(DATE_FORMAT).to_string()),
			Cell::Text(s) => Json::String(s.clone()),
		}
	}

	fn rank(&self) -> u8 {
		match self {
			Cell::Null => 0,
			Cell::Bool(_) => 1,
			Cell::Int(_) | Cell::Float(_) => 2,
			Cell::Date(_) => 3,
			Cell::Text(_) => 4,
		}
	}
}

impl PartialEq for Cell {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Cell::Null, Cell::Null) => true,
			(Cell::Bool(a), Cell::Bool(b)) => a == b,
			(Cell::Int(a), Cell::Int(b)) => a == b,
			(Cell::Float(a), Cell::Float(b)) => a.to_bits() == b.to_bits(),
			(Cell::Date(a), Cell::Date(b)) => a == b,
			(Cell::Text(a), Cell::Text(b)) => a == b,
			_ => false,
		}
	}
}

impl Eq for Cell {}

impl Hash for Cell {
	fn hash<H: Hasher>(&self, state: &mut H) {
		std::mem::discriminant(self).hash(state);
		match self {
			Cell::Null => {}
			Cell::Bool(b) => b.hash(state),
			Cell::Int(i) => i.hash(state),
			Cell::Float(f) => f.to_bits().hash(state),
			Cell::Date(d) => d.hash(state),
			Cell::Text(s) => s.hash(state),
		}
	}
}

impl Ord for Cell {
	fn cmp(&self, other: &Self) -> Ordering {
		match (self, other) {
			(Cell::Bool(a), Cell::Bool(b)) => a.cmp(b),
			(Cell::Int(a), Cell::Int(b)) => a.cmp(b),
			(Cell::Date(a), Cell::Date(b)) => a.cmp(b),
			(Cell::Text(a), Cell::Text(b)) => a.cmp(b),
			(Cell::Float(_), _) | (_, Cell::Float(_)) if self.rank() == other.rank() => {
				let a = self.as_f64().unwrap_or(f64::NAN);
				let b = other.as_f64().unwrap_or(f64::NAN);
				// Int sorts before an equal Float to stay consistent with Eq
				a.total_cmp(&b).then_with(|| {
					matches!(self, Cell::Float(_)).cmp(&matches!(other, Cell::Float(_)))
				})
			}
			_ => self.rank().cmp(&other.rank()),
		}
	}
}

impl PartialOrd for Cell {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Display for Cell {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Cell::Null => f.write_str("null"),
			Cell::Bool(b) => fmt::Display::fmt(b, f),
			Cell::Int(i) => fmt::Display::fmt(i, f),
			Cell::Float(v) => fmt::Display::fmt(v, f),
			Cell::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
			Cell::Text(s) => f.write_str(s),
		}
	}
}

impl From<i64> for Cell {
	fn from(value: i64) -> Self {
		Cell::Int(value)
	}
}

impl From<f64> for Cell {
	fn from(value: f64) -> Self {
		Cell::Float(value)
	}
}

impl From<bool> for Cell {
	fn from(value: bool) -> Self {
		Cell::Bool(value)
	}
}

impl From<&str> for Cell {
	fn from(value: &str) -> Self {
		Cell::Text(value.to_owned())
	}
}

impl From<String> for Cell {
	fn from(value: String) -> Self {
		Cell::Text(value)
	}
}

impl From<NaiveDate> for Cell {
	fn from(value: NaiveDate) -> Self {
		Cell::Date(value)
	}
}
