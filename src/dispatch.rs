//! Asynchronous units of propagation work and the dispatchers running them.
//!
//! A task is plain data: the receiving side rebuilds a calculator from the
//! [`Engine`] it runs with. Two dispatchers are provided. [`Queue`] keeps
//! tasks in process and drains them on demand, [`TokioDispatcher`] sends
//! them to a [`Worker`] that runs them on a tokio runtime, one at a time per
//! dataset.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use enclose::enclose;
use futures::stream::{FuturesUnordered, StreamExt};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

use crate::calculator::Update;
use crate::dataset::DatasetId;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::graph::Trail;

/// One `calculate_updates` call waiting to run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateTask {
	pub dataset: DatasetId,
	pub update: Update,
	/// Merge provenance for the new rows.
	pub parent: Option<DatasetId>,
	/// Runs already attempted, starting at 0.
	pub attempt: u32,
	pub trail: Trail,
}

impl UpdateTask {
	pub fn new(dataset: DatasetId, update: Update) -> Self {
		UpdateTask {
			dataset,
			update,
			parent: None,
			attempt: 0,
			trail: Trail::new(),
		}
	}

	pub fn with_parent(mut self, parent: DatasetId) -> Self {
		self.parent = Some(parent);
		self
	}

	fn retry(mut self) -> Self {
		self.attempt += 1;
		self
	}
}

/// Fire-and-forget task submission.
#[cfg_attr(test, mockall::automock)]
pub trait Dispatch: Send + Sync {
	fn dispatch(&self, task: UpdateTask);

	/// Submits `task` once `delay` has passed.
	fn dispatch_after(&self, task: UpdateTask, delay: Duration);
}

/// Runs `task` once. A dataset that is not ready yet gets the task
/// rescheduled with backoff until the attempts run out.
pub fn execute(engine: &Engine, task: UpdateTask) -> Result<()> {
	let result = engine
		.calculator(task.dataset.clone())
		.calculate_updates(&task.update, task.parent.as_ref(), &task.trail);

	match result {
		Ok(()) => Ok(()),
		Err(err) if err.is_retryable() => {
			let retry = &engine.settings.retry;
			if retry.allows_retry(task.attempt) {
				let delay = retry.delay(task.attempt);
				debug!(dataset = %task.dataset, attempt = task.attempt, ?delay, "dataset not ready, retrying");
				engine.dispatcher.dispatch_after(task.retry(), delay);
				Ok(())
			} else {
				warn!(dataset = %task.dataset, attempts = task.attempt + 1, "dataset never became ready, dropping update");
				Err(err)
			}
		}
		Err(err) => {
			error!(dataset = %task.dataset, %err, "update failed");
			Err(err)
		}
	}
}

/// In-process FIFO of tasks. Delays are recorded but not waited for.
#[derive(Default)]
pub struct Queue {
	tasks: Mutex<VecDeque<UpdateTask>>,
	delays: Mutex<Vec<Duration>>,
}

impl Queue {
	pub fn new() -> Arc<Self> {
		Arc::new(Queue::default())
	}

	pub fn len(&self) -> usize {
		self.tasks.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.tasks.lock().is_empty()
	}

	/// Delays requested through [`Dispatch::dispatch_after`] so far.
	pub fn delays(&self) -> Vec<Duration> {
		self.delays.lock().clone()
	}

	/// Runs queued tasks, and the tasks they queue, until none is left.
	/// Returns the errors of tasks that failed for good.
	pub fn run(&self, engine: &Engine) -> Vec<Error> {
		let mut failed = Vec::new();
		loop {
			let tasks = std::mem::take(&mut *self.tasks.lock());
			if tasks.is_empty() {
				break;
			}

			for task in tasks {
				if let Err(err) = execute(engine, task) {
					failed.push(err);
				}
			}
		}
		failed
	}
}

impl Dispatch for Queue {
	fn dispatch(&self, task: UpdateTask) {
		self.tasks.lock().push_back(task);
	}

	fn dispatch_after(&self, task: UpdateTask, delay: Duration) {
		self.delays.lock().push(delay);
		self.tasks.lock().push_back(task);
	}
}

/// Sends tasks to a [`Worker`].
pub struct TokioDispatcher {
	sender: UnboundedSender<UpdateTask>,
	pending: Arc<AtomicUsize>,
	handle: Handle,
}

/// Receiving end of a [`TokioDispatcher`].
pub struct Inbox {
	receiver: UnboundedReceiver<UpdateTask>,
	pending: Arc<AtomicUsize>,
}

impl TokioDispatcher {
	/// Delayed tasks sleep on `handle`.
	pub fn new(handle: Handle) -> (Arc<Self>, Inbox) {
		let (sender, receiver) = unbounded_channel();
		let pending = Arc::new(AtomicUsize::new(0));
		let dispatcher = TokioDispatcher {
			sender,
			pending: pending.clone(),
			handle,
		};
		(Arc::new(dispatcher), Inbox { receiver, pending })
	}
}

impl Dispatch for TokioDispatcher {
	fn dispatch(&self, task: UpdateTask) {
		self.pending.fetch_add(1, Ordering::SeqCst);
		if let Err(err) = self.sender.send(task) {
			self.pending.fetch_sub(1, Ordering::SeqCst);
			warn!(dataset = %err.0.dataset, "worker stopped, update dropped");
		}
	}

	fn dispatch_after(&self, task: UpdateTask, delay: Duration) {
		self.pending.fetch_add(1, Ordering::SeqCst);
		let (sender, pending) = (&self.sender, &self.pending);
		self.handle.spawn(enclose!((sender, pending) async move {
			tokio::time::sleep(delay).await;
			if let Err(err) = sender.send(task) {
				pending.fetch_sub(1, Ordering::SeqCst);
				warn!(dataset = %err.0.dataset, "worker stopped, delayed update dropped");
			}
		}));
	}
}

/// Runs tasks from an [`Inbox`]. Tasks for the same dataset never overlap,
/// tasks for different datasets run concurrently.
///
/// Lanes only order the worker's own tasks. Column calculations write
/// directly, callers must not start one on a dataset with updates in flight.
pub struct Worker {
	engine: Engine,
	inbox: Inbox,
	lanes: FxHashMap<DatasetId, Arc<tokio::sync::Mutex<()>>>,
}

impl Worker {
	pub fn new(engine: Engine, inbox: Inbox) -> Self {
		Worker {
			engine,
			inbox,
			lanes: FxHashMap::default(),
		}
	}

	/// Runs tasks for as long as the inbox stays open.
	pub async fn run(mut self) {
		self.drain(false).await
	}

	/// Runs tasks until none is queued, running or waiting for its delay.
	pub async fn run_until_idle(&mut self) {
		self.drain(true).await
	}

	async fn drain(&mut self, stop_when_idle: bool) {
		let Worker {
			engine,
			inbox,
			lanes,
		} = self;
		let mut running = FuturesUnordered::new();

		loop {
			if stop_when_idle && running.is_empty() && inbox.pending.load(Ordering::SeqCst) == 0 {
				break;
			}

			tokio::select! {
				Some(task) = inbox.receiver.recv() => {
					let lane = lanes.entry(task.dataset.clone()).or_default().clone();
					let pending = inbox.pending.clone();
					running.push(tokio::spawn(enclose!((engine) async move {
						let _turn = lane.lock_owned().await;
						let dataset = task.dataset.clone();
						let done = tokio::task::spawn_blocking(move || execute(&engine, task)).await;
						if let Err(err) = done {
							error!(%dataset, %err, "update task panicked");
						}
						pending.fetch_sub(1, Ordering::SeqCst);
					})));
				}
				Some(joined) = running.next(), if !running.is_empty() => {
					if let Err(err) = joined {
						error!(%err, "worker task failed");
					}
				}
				else => break,
			}
		}
	}
}
