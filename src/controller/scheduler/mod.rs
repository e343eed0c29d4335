pub mod queue;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_channel::Receiver;
use async_trait::async_trait;
use tokio::{
    sync::Mutex,
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, error, info, warn};

use crate::{
    controller::{
        dispatcher::{PostExecution, ReconciliationDispatcher},
        retry::{RetryExecution, RetryPolicy},
        scheduler::queue::WorkQueue,
    },
    event::{EventHandler, ResourceEvent},
    operator::executor::Executor,
    resources::{Resource, metadata::ResourceId},
    utils::time::format_delay,
};

pub struct SchedulerConfig {
    pub worker_count: usize,
}

/// Per identity bookkeeping between executions.
#[derive(Default)]
struct ExecutionState {
    retry: Option<RetryExecution>,
    timer: Option<AbortHandle>,
    /// Resource version written by the error status hook after retries ran
    /// out. Executions of that exact version are skipped.
    exhausted_at: Option<String>,
}

impl ExecutionState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Feeds accepted events to a pool of workers, at most one execution per
/// identity at a time, and drives retries and reschedules.
pub struct EventProcessor<R: Resource> {
    name: String,
    config: SchedulerConfig,
    queue: WorkQueue,
    rx: Receiver<ResourceId>,
    dispatcher: Arc<ReconciliationDispatcher<R>>,
    retry: RetryPolicy,
    state: Mutex<HashMap<ResourceId, ExecutionState>>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: Resource> EventProcessor<R> {
    pub fn new(
        name: impl AsRef<str>,
        config: SchedulerConfig,
        dispatcher: Arc<ReconciliationDispatcher<R>>,
        retry: RetryPolicy,
    ) -> Self {
        let (queue, rx) = WorkQueue::new();

        Self {
            name: name.as_ref().to_string(),
            config,
            queue,
            rx,
            dispatcher,
            retry,
            state: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start_workers(self: &Arc<Self>, executor: &Executor) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("{}: starting {} workers", self.name, self.config.worker_count);
        let mut workers = self.workers.lock().await;
        for _ in 0..self.config.worker_count.max(1) {
            let this = self.clone();
            workers.push(executor.spawn(async move { this.work().await }));
        }
    }

    /// Stops accepting work and waits for in-flight executions to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.queue.close();
        {
            let mut state = self.state.lock().await;
            for (_, mut execution) in state.drain() {
                execution.cancel_timer();
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("{}: worker ended abnormally: {}", self.name, e);
            }
        }
        info!("{}: workers stopped", self.name);
    }

    async fn work(&self) {
        while let Ok(id) = self.rx.recv().await {
            if !self.is_running() {
                debug!("{}: stopped, dropping {}", self.name, id);
                continue;
            }

            self.queue.start(&id).await;

            if self.is_exhausted(&id).await {
                debug!("{}: retries of {} exhausted, waiting for a new change", self.name, id);
                self.queue.done(&id).await;
                continue;
            }

            let retry_info = {
                let state = self.state.lock().await;
                state
                    .get(&id)
                    .and_then(|execution| execution.retry.as_ref())
                    .map(RetryExecution::info)
            };

            let outcome = self.dispatcher.dispatch(&id, retry_info).await;
            self.post_execution(&id, outcome).await;

            self.queue.done(&id).await;
        }
    }

    /// Whether the cached copy of `id` is still the one its retries were
    /// exhausted on. Any other version clears the marker.
    async fn is_exhausted(&self, id: &ResourceId) -> bool {
        let mut state = self.state.lock().await;
        let Some(execution) = state.get_mut(id) else {
            return false;
        };
        let Some(version) = execution.exhausted_at.take() else {
            return false;
        };

        if self.dispatcher.cached_version(id).as_deref() == Some(version.as_str()) {
            execution.exhausted_at = Some(version);
            return true;
        }
        false
    }

    async fn post_execution(&self, id: &ResourceId, outcome: PostExecution) {
        let mut state = self.state.lock().await;

        match outcome {
            PostExecution::Gone => {
                if let Some(mut execution) = state.remove(id) {
                    execution.cancel_timer();
                }
            }
            PostExecution::Success { reschedule } => {
                if let Some(mut execution) = state.remove(id) {
                    execution.cancel_timer();
                }

                if let Some(delay) = reschedule {
                    debug!("{}: rescheduling {} in {}", self.name, id, format_delay(delay));
                    let timer = self.queue.push_after(id, delay).abort_handle();
                    state.insert(
                        id.clone(),
                        ExecutionState {
                            timer: Some(timer),
                            ..Default::default()
                        },
                    );
                }
            }
            PostExecution::Failure { error } => {
                let execution = state.entry(id.clone()).or_default();
                execution.cancel_timer();

                let retry = execution
                    .retry
                    .get_or_insert_with(|| self.retry.initial_execution());

                match retry.next_delay() {
                    Some(delay) => {
                        warn!(
                            "{}: reconciliation of {} failed (retry {} in {}): {:#}",
                            self.name,
                            id,
                            retry.attempt_count(),
                            format_delay(delay),
                            error
                        );

                        if self.queue.has_pending(id).await {
                            debug!("{}: {} has a pending event, not arming retry timer", self.name, id);
                        } else {
                            execution.timer = Some(self.queue.push_after(id, delay).abort_handle());
                        }
                    }
                    None => {
                        error!(
                            "{}: reconciliation of {} failed, retries exhausted: {:#}",
                            self.name, id, error
                        );

                        let retry_info = retry.info();
                        state.remove(id);
                        drop(state);

                        // the status write echoes back as an event
                        if let Some(version) = self
                            .dispatcher
                            .update_error_status(id, retry_info, &error)
                            .await
                        {
                            let mut state = self.state.lock().await;
                            state.entry(id.clone()).or_default().exhausted_at = Some(version);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<R: Resource> EventHandler for EventProcessor<R> {
    async fn handle_event(&self, event: ResourceEvent) {
        if !self.is_running() {
            debug!("{}: not running, ignoring {}", self.name, event);
            return;
        }

        debug!("{}: received {}", self.name, event);
        {
            // a real change supersedes pending retries and reschedules
            let mut state = self.state.lock().await;
            if let Some(execution) = state.get_mut(&event.id) {
                execution.cancel_timer();
                execution.retry = None;
            }
        }

        self.queue.push(&event.id).await;
    }
}
