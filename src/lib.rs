//! Keeps a network of derived tabular datasets consistent as rows arrive.
//!
//! Datasets are linked by merges, joins and aggregations. New rows are
//! appended by a [`Calculator`], which recomputes the dataset's
//! calculations on them and fans the change out to every dependent
//! dataset through a [`Dispatch`] implementation.

pub mod macros;

pub mod aggregation;
pub mod aggregator;
pub mod calculator;
pub mod cell;
pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod formula;
pub mod frame;
pub mod graph;
pub mod logging;
pub mod schema;
pub mod stats;
pub mod store;

mod hashed;

pub use aggregation::AggregationKind;
pub use aggregator::Aggregator;
pub use calculator::{Calculator, Update};
pub use cell::Cell;
pub use config::Settings;
pub use dataset::{Calculation, Dataset, DatasetId, GroupSpec, JoinLink, JoinSide};
pub use dispatch::{execute, Dispatch, Queue, TokioDispatcher, UpdateTask, Worker};
pub use engine::Engine;
pub use error::{Error, Result};
pub use formula::{Compile, Compiled, Parser, RowFunction};
pub use frame::{Column, Frame, RawRow, Row, PARENT_ID};
pub use graph::{Edge, Trail};
pub use hashed::Hashed;
pub use schema::{ColumnType, Schema};
pub use store::{FrameOptions, MemoryStore, Store};
