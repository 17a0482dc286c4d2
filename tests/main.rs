use std::sync::Arc;
use std::time::Duration;

use ripple::{
	execute, row, rows, Cell, ColumnType, Compiled, DatasetId, Engine, Error, Frame, FrameOptions,
	GroupSpec, MemoryStore, Queue, RawRow, Row, RowFunction, Schema, Settings, Store,
	TokioDispatcher, Trail, Update, UpdateTask, Worker, PARENT_ID,
};


use mock::{MockCompiler, SharedMock};

struct Harness {
	store: Arc<MemoryStore>,
	queue: Arc<Queue>,
	engine: Engine,
}

impl Harness {
	fn new() -> Self {
		let store = MemoryStore::new();
		let queue = Queue::new();
		let engine = Engine::new(store.clone(), queue.clone());
		Harness { store, queue, engine }
	}

	fn dataset(&self, rows: Vec<RawRow>) -> DatasetId {
		let frame = Frame::from_raw(&rows);
		self.store.create(Schema::from_frame(&frame), frame)
	}

	fn rows(&self, id: &DatasetId) -> Frame {
		self.store.dframe(id, FrameOptions::default()).unwrap()
	}

	fn settle(&self) {
		let failed = self.queue.run(&self.engine);
		assert!(failed.is_empty(), "failed tasks: {failed:?}");
	}
}

fn find<'a>(frame: &'a Frame, column: &str, value: Cell) -> &'a Row {
	frame
		.rows()
		.iter()
		.find(|row| row[column] == value)
		.unwrap_or_else(|| panic!("no row with {column} = {value}"))
}

fn grouped_dataset(h: &Harness) -> (DatasetId, DatasetId) {
	let schema = Schema::new()
		.with_column("g", ColumnType::Text)
		.with_column("a", ColumnType::Integer);
	let id = h.store.create(schema, Frame::default());
	h.engine
		.calculator(id.clone())
		.calculate_column("sum(a)", "total", Some(GroupSpec::parse("g")))
		.unwrap();
	let aggregated = h.store.dataset(&id).unwrap().aggregated_datasets[&GroupSpec::parse("g")]
		.clone();
	(id, aggregated)
}

#[test]
fn calculated_column_is_stored() {
	let h = Harness::new();
	let id = h.dataset(rows![{ "a" => 1, "b" => 2 }]);

	h.engine
		.calculator(id.clone())
		.calculate_column("a + b", "c", None)
		.unwrap();

	let frame = h.rows(&id);
	assert_eq!(frame.len(), 1);
	assert_eq!(frame.rows()[0]["a"], Cell::Int(1));
	assert_eq!(frame.rows()[0]["b"], Cell::Int(2));
	assert_eq!(frame.rows()[0]["c"], Cell::Int(3));

	let meta = h.store.dataset(&id).unwrap();
	assert_eq!(meta.calculations.len(), 1);
	assert_eq!(meta.calculations[0].formula, "a + b");
	assert!(meta.schema.contains("c"));
}

#[test]
fn recorded_calculation_runs_on_new_rows() {
	let h = Harness::new();
	let id = h.dataset(rows![{ "a" => 1, "b" => 2 }]);
	h.engine
		.calculator(id.clone())
		.calculate_column("a * b", "c", None)
		.unwrap();

	h.engine
		.update(&id, Update::from(rows![{ "a" => 3, "b" => 4 }, { "a" => 5, "b" => 6 }]))
		.unwrap();

	let frame = h.rows(&id);
	assert_eq!(frame.len(), 3);
	assert_eq!(find(&frame, "a", Cell::Int(3))["c"], Cell::Int(12));
	assert_eq!(find(&frame, "a", Cell::Int(5))["c"], Cell::Int(30));
}

#[test]
fn grouped_sum_follows_updates() {
	let h = Harness::new();
	let (id, aggregated) = grouped_dataset(&h);

	h.engine
		.update(
			&id,
			Update::from(rows![
				{ "g" => "x", "a" => 1 },
				{ "g" => "x", "a" => 2 },
				{ "g" => "y", "a" => 5 },
			]),
		)
		.unwrap();

	let frame = h.rows(&aggregated);
	assert_eq!(frame.len(), 2);
	assert_eq!(find(&frame, "g", Cell::from("x"))["total"], Cell::Int(3));
	assert_eq!(find(&frame, "g", Cell::from("y"))["total"], Cell::Int(5));

	h.engine
		.update(&id, Update::from(rows![{ "g" => "x", "a" => 10 }, { "g" => "z", "a" => 4 }]))
		.unwrap();

	let frame = h.rows(&aggregated);
	assert_eq!(frame.len(), 3);
	assert_eq!(find(&frame, "g", Cell::from("x"))["total"], Cell::Int(13));
	assert_eq!(find(&frame, "g", Cell::from("y"))["total"], Cell::Int(5));
	assert_eq!(find(&frame, "g", Cell::from("z"))["total"], Cell::Int(4));
}

#[test]
fn aggregations_on_one_group_share_a_dataset() {
	let h = Harness::new();
	let id = h.dataset(rows![
		{ "g" => "x", "a" => 1 },
		{ "g" => "x", "a" => 3 },
		{ "g" => "y", "a" => 5 },
	]);
	let calculator = h.engine.calculator(id.clone());
	calculator
		.calculate_column("sum(a)", "total", Some(GroupSpec::parse("g")))
		.unwrap();
	calculator
		.calculate_column("mean(a)", "average", Some(GroupSpec::parse("g")))
		.unwrap();

	let meta = h.store.dataset(&id).unwrap();
	assert_eq!(meta.aggregated_datasets.len(), 1);

	let aggregated = &meta.aggregated_datasets[&GroupSpec::parse("g")];
	h.engine
		.update(&id, Update::from(row! { "g" => "x", "a" => 8 }))
		.unwrap();

	let frame = h.rows(aggregated);
	let x = find(&frame, "g", Cell::from("x"));
	assert_eq!(x["total"], Cell::Int(12));
	assert_eq!(x["average"], Cell::Float(4.0));
	assert_eq!(find(&frame, "g", Cell::from("y"))["average"], Cell::Float(5.0));
}

#[test]
fn not_ready_dataset_is_untouched_and_retried_once() {
	let store = MemoryStore::new();
	let id = store.create(
		Schema::new().with_column("a", ColumnType::Integer),
		Frame::default(),
	);
	store.set_ready(&id, false).unwrap();
	let version = store.version(&id).unwrap();

	let mock = SharedMock::new();
	let engine = Engine::new(store.clone(), Arc::new(mock.clone()));

	mock.get().expect_dispatch().never();
	mock.get()
		.expect_dispatch_after()
		.withf(|task, _| task.attempt == 1)
		.times(1)
		.return_const(());

	let task = UpdateTask::new(id.clone(), Update::from(row! { "a" => 1 }));
	execute(&engine, task).unwrap();

	mock.get().checkpoint();
	assert_eq!(store.version(&id).unwrap(), version);
	assert_eq!(store.dataset(&id).unwrap().num_rows, 0);

	// an insert from the outside is retried the same way
	mock.get().expect_dispatch().never();
	mock.get()
		.expect_dispatch_after()
		.withf(|task, _| task.attempt == 1 && task.parent.is_none())
		.times(1)
		.return_const(());

	engine.update(&id, Update::from(row! { "a" => 1 })).unwrap();
	mock.get().checkpoint();
	assert_eq!(store.version(&id).unwrap(), version);
}

#[test]
fn retry_after_not_ready_matches_a_single_update() {
	let h = Harness::new();
	let retried = h.dataset(rows![{ "a" => 1, "b" => 2 }]);
	let direct = h.dataset(rows![{ "a" => 1, "b" => 2 }]);
	for id in [&retried, &direct] {
		h.engine
			.calculator(id.clone())
			.calculate_column("a + b", "c", None)
			.unwrap();
	}
	let update = Update::from(rows![{ "a" => 10, "b" => 20 }]);

	h.store.set_ready(&retried, false).unwrap();
	execute(&h.engine, UpdateTask::new(retried.clone(), update.clone())).unwrap();
	assert_eq!(h.queue.len(), 1);
	assert_eq!(h.rows(&retried).len(), 1);

	h.store.set_ready(&retried, true).unwrap();
	h.settle();
	h.engine.update(&direct, update).unwrap();

	assert_eq!(h.rows(&retried), h.rows(&direct));
	assert_eq!(h.queue.delays(), vec![Duration::from_millis(250)]);
}

fn joined(h: &Harness) -> (DatasetId, DatasetId, DatasetId) {
	let lookup = h.dataset(rows![{ "k" => 1, "v" => "a" }]);
	let data = h.dataset(rows![{ "k" => 1, "w" => 10 }, { "k" => 2, "w" => 20 }]);
	let result = h.store.join(&data, &lookup, "k").unwrap();
	(lookup, data, result)
}

#[test]
fn update_breaking_join_key_is_rejected() {
	let h = Harness::new();
	let (lookup, _, result) = joined(&h);
	let version = h.store.version(&lookup).unwrap();
	let result_version = h.store.version(&result).unwrap();

	let err = h
		.engine
		.update(&lookup, Update::from(row! { "k" => 1, "v" => "b" }))
		.unwrap_err();
	assert!(matches!(err, Error::NonUniqueJoin { ref on, .. } if on == "k"));

	let err = h
		.engine
		.update(
			&lookup,
			Update::from(rows![{ "k" => 3, "v" => "c" }, { "k" => 3, "v" => "d" }]),
		)
		.unwrap_err();
	assert!(matches!(err, Error::NonUniqueJoin { .. }));

	assert_eq!(h.store.version(&lookup).unwrap(), version);
	assert_eq!(h.store.version(&result).unwrap(), result_version);
	assert!(h.queue.is_empty());
}

#[test]
fn lookup_update_recomputes_join() {
	let h = Harness::new();
	let (lookup, _, result) = joined(&h);
	assert_eq!(find(&h.rows(&result), "k", Cell::Int(2))["v"], Cell::Null);

	h.engine
		.update(&lookup, Update::from(row! { "k" => 2, "v" => "b" }))
		.unwrap();

	let frame = h.rows(&result);
	assert_eq!(frame.len(), 2);
	assert_eq!(find(&frame, "k", Cell::Int(1))["v"], Cell::from("a"));
	assert_eq!(find(&frame, "k", Cell::Int(2))["v"], Cell::from("b"));
}

#[test]
fn joined_rows_flow_into_join_result() {
	let h = Harness::new();
	let (_, data, result) = joined(&h);

	h.engine
		.update(&data, Update::from(row! { "k" => 1, "w" => 30 }))
		.unwrap();
	assert_eq!(h.rows(&result).len(), 2);

	h.settle();
	let frame = h.rows(&result);
	assert_eq!(frame.len(), 3);
	let added = find(&frame, "w", Cell::Int(30));
	assert_eq!(added["v"], Cell::from("a"));
	assert_eq!(added["k"], Cell::Int(1));
}

#[test]
fn lookup_keys_missing_from_the_other_side_leave_join_alone() {
	let h = Harness::new();
	let (lookup, _, result) = joined(&h);
	let result_version = h.store.version(&result).unwrap();

	h.engine
		.update(&lookup, Update::from(row! { "k" => 7, "v" => "z" }))
		.unwrap();

	assert_eq!(h.rows(&lookup).len(), 2);
	assert_eq!(h.store.version(&result).unwrap(), result_version);
	assert!(h.queue.is_empty());
}

#[test]
fn kept_calculator_appends_to_the_current_table() {
	let h = Harness::new();
	let id = h.dataset(rows![{ "a" => 1 }]);
	let calculator = h.engine.calculator(id.clone());
	calculator.validate("a + 1", None).unwrap();

	h.engine.update(&id, Update::from(row! { "a" => 2 })).unwrap();
	calculator
		.calculate_updates(&Update::from(row! { "a" => 3 }), None, &Trail::new())
		.unwrap();

	let values: Vec<Cell> = h.rows(&id).values("a").cloned().collect();
	assert_eq!(values, vec![Cell::Int(1), Cell::Int(2), Cell::Int(3)]);

	h.engine.update(&id, Update::from(row! { "a" => 4 })).unwrap();
	calculator.calculate_column("a * 10", "b", None).unwrap();

	let frame = h.rows(&id);
	assert_eq!(frame.len(), 4);
	assert_eq!(find(&frame, "a", Cell::Int(4))["b"], Cell::Int(40));
}

fn tagged(frame: &Frame, parent: &DatasetId) -> Vec<Row> {
	let tag = Cell::Text(parent.to_string());
	frame
		.rows()
		.iter()
		.filter(|row| row[PARENT_ID] == tag)
		.map(|row| {
			let mut row = row.clone();
			row.remove(PARENT_ID);
			row
		})
		.collect()
}

#[test]
fn merged_dataset_mirrors_its_parents() {
	let h = Harness::new();
	let a = h.dataset(rows![{ "x" => 1 }]);
	let b = h.dataset(rows![{ "x" => 2 }]);
	let merged = h.store.merge(&[a.clone(), b.clone()]).unwrap();

	h.engine
		.update(&a, Update::from(row! { "x" => 5 }))
		.unwrap();
	h.settle();

	let frame = h.store.dframe(&merged, FrameOptions::with_parent_ids()).unwrap();
	assert_eq!(frame.len(), 3);
	assert_eq!(tagged(&frame, &a), h.rows(&a).into_rows());
	assert_eq!(tagged(&frame, &b), h.rows(&b).into_rows());

	h.engine
		.calculator(a.clone())
		.calculate_column("x * 2", "y", None)
		.unwrap();

	let frame = h.store.dframe(&merged, FrameOptions::with_parent_ids()).unwrap();
	assert_eq!(frame.len(), 3);
	assert_eq!(tagged(&frame, &a), h.rows(&a).into_rows());
	assert_eq!(find(&frame, "x", Cell::Int(5))["y"], Cell::Int(10));
	assert_eq!(find(&frame, "x", Cell::Int(2))["y"], Cell::Null);
}

#[test]
fn merged_children_of_aggregation_get_the_whole_table() {
	let h = Harness::new();
	let (id, aggregated) = grouped_dataset(&h);
	let merged = h.store.merge(&[aggregated.clone()]).unwrap();

	h.engine
		.update(&id, Update::from(rows![{ "g" => "x", "a" => 1 }, { "g" => "y", "a" => 2 }]))
		.unwrap();
	h.settle();
	h.engine
		.update(&id, Update::from(row! { "g" => "x", "a" => 4 }))
		.unwrap();
	h.settle();

	let frame = h.store.dframe(&merged, FrameOptions::with_parent_ids()).unwrap();
	assert_eq!(frame.len(), 2);
	assert_eq!(find(&frame, "g", Cell::from("x"))["total"], Cell::Int(5));
	assert_eq!(find(&frame, "g", Cell::from("x"))[PARENT_ID], Cell::Text(aggregated.to_string()));
	assert_eq!(find(&frame, "g", Cell::from("y"))["total"], Cell::Int(2));
}

#[test]
fn propagation_stops_at_cycles() {
	let h = Harness::new();
	let a = h.dataset(rows![{ "x" => 1 }]);
	let b = h.store.merge(&[a.clone()]).unwrap();

	let mut meta = h.store.dataset(&b).unwrap();
	meta.merged_datasets.push(a.clone());
	let frame = h.store.dframe(&b, FrameOptions::complete()).unwrap();
	h.store.insert(meta, frame);

	h.engine
		.update(&a, Update::from(row! { "x" => 2 }))
		.unwrap();
	h.settle();

	assert_eq!(h.rows(&a).len(), 2);
	assert_eq!(h.rows(&b).len(), 2);

	h.engine
		.calculator(a.clone())
		.calculate_column("x + 1", "y", None)
		.unwrap();
	assert_eq!(find(&h.rows(&b), "x", Cell::Int(2))["y"], Cell::Int(3));
}

#[test]
fn broken_merged_child_does_not_stop_its_siblings() {
	let h = Harness::new();
	let a = h.dataset(rows![{ "x" => 1 }]);
	let merged = h.store.merge(&[a.clone()]).unwrap();

	let mut meta = h.store.dataset(&a).unwrap();
	meta.merged_datasets.insert(0, DatasetId::from("gone"));
	let frame = h.store.dframe(&a, FrameOptions::complete()).unwrap();
	h.store.insert(meta, frame);

	h.engine
		.calculator(a.clone())
		.calculate_column("x + 1", "y", None)
		.unwrap();

	let frame = h.rows(&merged);
	assert!(frame.has_column("y"));
	assert_eq!(find(&frame, "x", Cell::Int(1))["y"], Cell::Int(2));

	h.engine.update(&a, Update::from(row! { "x" => 5 })).unwrap();
	let failed = h.queue.run(&h.engine);
	assert_eq!(failed.len(), 1);
	assert!(matches!(failed[0], Error::UnknownDataset(_)));
	assert_eq!(find(&h.rows(&merged), "x", Cell::Int(5))["y"], Cell::Int(6));
}

#[test]
fn failing_row_function_surfaces_as_execution_error() {
	let h = Harness::new();
	let id = h.dataset(rows![{ "a" => 1 }, { "a" => 2 }]);
	let version = h.store.version(&id).unwrap();

	let mut compiler = MockCompiler::new();
	compiler.expect_validate().returning(|_, _, _| Ok(None));
	compiler.expect_compile().returning(|_, _| {
		let function: RowFunction = Arc::new(|row: &Row| match &row["a"] {
			Cell::Int(2) => Err("two".to_owned()),
			other => Ok(other.clone()),
		});
		Ok(Compiled {
			aggregation: None,
			functions: vec![function],
		})
	});
	let engine = h.engine.clone().with_compiler(Arc::new(compiler));

	let err = engine
		.calculator(id.clone())
		.calculate_column("anything", "copy", None)
		.unwrap_err();
	assert!(matches!(err, Error::CalculationExecution { row: 1, .. }));
	assert_eq!(h.store.version(&id).unwrap(), version);
}

#[test]
fn summary_stats_are_invalidated_by_updates() {
	let h = Harness::new();
	let id = h.dataset(rows![{ "a" => 1 }]);
	h.store.summary_stats(&id).unwrap();

	h.engine
		.update(&id, Update::from(row! { "a" => 2 }))
		.unwrap();
	assert!(!h.store.has_cached_stats(&id).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_runs_propagation_and_retries() {
	let store = MemoryStore::new();
	let settings = Settings::from_toml_str(
		"[retry]\nmax_attempts = 8\nbase_delay_ms = 10\nmax_delay_ms = 200\n",
	)
	.unwrap();
	let (dispatcher, inbox) = TokioDispatcher::new(tokio::runtime::Handle::current());
	let engine = Engine::new(store.clone(), dispatcher).with_settings(settings);
	let mut worker = Worker::new(engine.clone(), inbox);

	let frame = Frame::from_raw(&rows![{ "x" => 1 }]);
	let a = store.create(Schema::from_frame(&frame), frame);
	let merged = store.merge(&[a.clone()]).unwrap();
	store.set_ready(&merged, false).unwrap();

	engine
		.update(&a, Update::from(rows![{ "x" => 2 }, { "x" => 3 }]))
		.unwrap();

	let ready = tokio::spawn({
		let store = store.clone();
		let merged = merged.clone();
		async move {
			tokio::time::sleep(Duration::from_millis(30)).await;
			store.set_ready(&merged, true).unwrap();
		}
	});

	worker.run_until_idle().await;
	ready.await.unwrap();

	let frame = store.dframe(&merged, FrameOptions::default()).unwrap();
	assert_eq!(frame.len(), 3);
	assert_eq!(find(&frame, "x", Cell::Int(3))["x"], Cell::Int(3));
}
