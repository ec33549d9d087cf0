//! Concurrent case scheduler.
//!
//! The scheduler owns the worker table and the shared reply channel. It
//! starts up to `max_servers` workers (never more than there are cases),
//! waits for every startup acknowledgment, then advances one worker's
//! state machine per reply until no worker is left in use:
//!
//! ```text
//! Empty ──load──▶ Ready ──execute──▶ Completed ──reload──▶ Ready
//!   │               ▲                    │                   ▲
//!   └─ load fails:  │                    └─ reload fails ──▶ Error
//!      abandoned    └───────────── reload succeeds ─────────────┘
//! ```
//!
//! Work is picked with strict priority: startup cases, then retries,
//! then fresh cases from the source.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use casegrid_alloc::ResourceAllocator;
use casegrid_core::{Case, Recorder, ResourceRequirements, ServerInfo};
use casegrid_replicate::{Bundle, ModelReplicator};

use crate::driver::{DriverSettings, RunState, record_case};
use crate::error::{DriverError, DriverResult};
use crate::evaluation::{CaseFailure, Disposition, prepare, settle};
use crate::table::{WorkerId, WorkerRecord, WorkerState, WorkerTable};
use crate::worker::{Notification, Reply, Request, WorkerChannel, WorkerContext};

/// Message recorded for cases left over when every worker has been lost.
pub(crate) const NO_WORKER_MSG: &str = "no worker available to evaluate case";

pub(crate) struct CaseScheduler<'a> {
    settings: &'a DriverSettings,
    allocator: Arc<dyn ResourceAllocator>,
    replicator: Arc<dyn ModelReplicator>,
    bundle: Arc<Bundle>,
    events: Arc<[String]>,
    run: &'a mut RunState,
    recorder: &'a mut Option<Box<dyn Recorder>>,
    stop: watch::Receiver<bool>,
    table: WorkerTable,
    replies_tx: UnboundedSender<Notification>,
    replies: UnboundedReceiver<Notification>,
}

impl<'a> CaseScheduler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &'a DriverSettings,
        allocator: Arc<dyn ResourceAllocator>,
        replicator: Arc<dyn ModelReplicator>,
        bundle: Arc<Bundle>,
        run: &'a mut RunState,
        recorder: &'a mut Option<Box<dyn Recorder>>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let (replies_tx, replies) = mpsc::unbounded_channel();
        Self {
            settings,
            allocator,
            replicator,
            bundle,
            events: Arc::from(settings.events.clone()),
            run,
            recorder,
            stop,
            table: WorkerTable::default(),
            replies_tx,
            replies,
        }
    }

    /// Evaluate every case, then shut all workers down.
    ///
    /// Workers are shut down (and their servers released) whether or not
    /// dispatch succeeded.
    pub async fn run(mut self) -> DriverResult<()> {
        let requirements = self.bundle.requirements.clone();
        let max_servers = self.allocator.max_servers(&requirements);
        debug!(max_servers, "server capacity");
        if max_servers <= 0 {
            return Err(DriverError::Allocation(format!(
                "no servers supporting required resources {requirements:?}"
            )));
        }

        let result = self.dispatch(max_servers as usize, &requirements).await;
        self.shutdown().await;
        result
    }

    async fn dispatch(
        &mut self,
        max_servers: usize,
        requirements: &ResourceRequirements,
    ) -> DriverResult<()> {
        self.start_workers(max_servers, requirements)?;
        if self.table.len() == 0 {
            debug!("no cases to evaluate");
            return Ok(());
        }

        self.await_startup().await;
        if !self.table.busy() {
            return Err(DriverError::NoWorkersStarted);
        }

        for id in self.table.ids() {
            if self.table.get(id).is_some_and(|r| r.in_use) {
                self.begin(id);
            }
        }

        while self.table.busy() {
            let idle = self.run.todo.is_empty() && self.run.rerun.is_empty() && self.run.exhausted();
            let received = if idle {
                // Only completions are outstanding; bound the wait.
                match timeout(self.settings.idle_timeout, self.replies.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.log_idle_timeout();
                        continue;
                    }
                }
            } else {
                self.replies.recv().await
            };

            let Some(notification) = received else {
                error!("reply channel closed unexpectedly");
                break;
            };
            self.handle(notification);
        }

        self.drain_unassigned();
        Ok(())
    }

    /// Start workers, pulling one case per worker so no worker starts
    /// with nothing to do.
    fn start_workers(
        &mut self,
        max_servers: usize,
        requirements: &ResourceRequirements,
    ) -> DriverResult<()> {
        while self.table.len() < max_servers {
            if self.stopped() {
                break;
            }
            if self.table.len() >= self.run.todo.len() + self.run.rerun.len() {
                match self.run.next_case() {
                    Some(case) => self.run.todo.push_back(case),
                    None => break,
                }
            }

            let id = self.table.len();
            let name = format!("{}-{}", self.settings.name, id + 1);
            debug!(worker = %name, "starting worker");
            let channel = WorkerChannel::spawn(WorkerContext {
                id,
                name: name.clone(),
                allocator: self.allocator.clone(),
                replicator: self.replicator.clone(),
                requirements: requirements.clone(),
                replies: self.replies_tx.clone(),
            })?;
            self.table.insert(WorkerRecord::new(name, channel));
        }
        info!(workers = self.table.len(), max_servers, "workers starting");
        Ok(())
    }

    /// Wait until every started worker has acknowledged startup, or the
    /// startup timeout passes.
    async fn await_startup(&mut self) {
        let deadline = Instant::now() + self.settings.startup_timeout;
        let mut pending = self.table.len();

        while pending > 0 {
            match timeout_at(deadline, self.replies.recv()).await {
                Ok(Some(Notification {
                    worker,
                    reply: Reply::Started(outcome),
                })) => {
                    pending -= 1;
                    self.on_started(worker, outcome);
                }
                Ok(Some(notification)) => {
                    warn!(worker = notification.worker, "unexpected reply during startup");
                }
                Ok(None) => break,
                Err(_) => {
                    for (_, record) in self.table.iter_mut() {
                        if record.in_use && record.info.is_none() {
                            error!(worker = %record.name, "no startup reply, abandoning worker");
                            record.in_use = false;
                        }
                    }
                    break;
                }
            }
        }
    }

    fn on_started(&mut self, id: WorkerId, outcome: Result<ServerInfo, String>) {
        let Some(record) = self.table.get_mut(id) else {
            return;
        };
        match outcome {
            Ok(info) => {
                debug!(worker = %record.name, server = %info.name, "startup acknowledged");
                record.info = Some(info);
            }
            Err(e) => {
                warn!(worker = %record.name, error = %e, "server startup failed");
                record.in_use = false;
            }
        }
    }

    fn handle(&mut self, notification: Notification) {
        let Notification { worker, reply } = notification;
        let Some(record) = self.table.get_mut(worker) else {
            error!(worker, "reply from unknown worker");
            return;
        };
        debug!(worker = %record.name, state = ?record.state, "worker reply");

        match reply {
            Reply::Started(Ok(info)) => {
                warn!(worker = %record.name, server = %info.name, "startup reply after timeout, worker left idle");
                record.info = Some(info);
            }
            Reply::Started(Err(e)) => {
                warn!(worker = %record.name, error = %e, "late server startup failure");
            }
            Reply::Loaded(outcome) => self.on_loaded(worker, outcome),
            Reply::Executed { case, outcome } => self.on_executed(worker, case, outcome),
            Reply::ShutdownAck => {
                warn!(worker = %record.name, "unexpected shutdown acknowledgment");
                record.in_use = false;
            }
        }
    }

    /// `Empty`: load the model if there is anything to do.
    fn begin(&mut self, id: WorkerId) {
        if self.stopped() {
            self.retire(id, "stop requested");
        } else if !self.run.has_work() {
            self.retire(id, "no more cases");
        } else {
            self.request_load(id);
        }
    }

    fn on_loaded(&mut self, id: WorkerId, outcome: Result<(), String>) {
        let max_attempts = self.settings.max_reload_attempts;
        let bundle_id = self.bundle.id.clone();
        let Some(record) = self.table.get_mut(id) else {
            return;
        };
        if !record.in_use {
            return;
        }

        match outcome {
            Ok(()) => {
                record.bundle = Some(bundle_id);
                record.reload_failures = 0;
                record.state = WorkerState::Ready;
                self.ready(id);
            }
            Err(e) if record.state == WorkerState::Empty => {
                error!(worker = %record.name, error = %e, "initial model load failed, abandoning worker");
                record.in_use = false;
            }
            Err(e) => {
                record.state = WorkerState::Error;
                record.reload_failures += 1;
                if record.reload_failures >= max_attempts {
                    error!(
                        worker = %record.name,
                        attempts = record.reload_failures,
                        error = %e,
                        "model reload keeps failing, retiring worker"
                    );
                    record.in_use = false;
                } else {
                    warn!(worker = %record.name, error = %e, "model reload failed, retrying");
                    self.request_load(id);
                }
            }
        }
    }

    /// `Ready`: pick the next case for this worker, or retire it.
    fn ready(&mut self, id: WorkerId) {
        if self.stopped() {
            self.retire(id, "stop requested");
            return;
        }

        if let Some(case) = self.run.todo.pop_front() {
            self.run_case(id, case, false);
        } else if let Some(case) = self.run.rerun.pop_front() {
            self.run_case(id, case, true);
        } else if let Some(case) = self.run.next_case() {
            self.run_case(id, case, false);
        } else {
            self.retire(id, "no more cases");
        }
    }

    fn run_case(&mut self, id: WorkerId, mut case: Case, rerun: bool) {
        prepare(&mut case, self.settings.max_retries, rerun);
        let Some(record) = self.table.get_mut(id) else {
            self.run.todo.push_front(case);
            return;
        };

        debug!(worker = %record.name, case = %case.id, rerun, "run case");
        record.in_flight = Some(case.id.clone());
        let request = Request::Execute {
            case,
            events: self.events.clone(),
        };
        if let Err(request) = record.channel.send(request) {
            error!(worker = %record.name, "worker gone, retiring");
            record.in_flight = None;
            record.in_use = false;
            if let Request::Execute { case, .. } = request {
                if rerun {
                    self.run.rerun.push_front(case);
                } else {
                    self.run.todo.push_front(case);
                }
            }
        }
    }

    /// `Completed`: record or requeue the case, then reload or move on.
    fn on_executed(&mut self, id: WorkerId, case: Case, outcome: Result<(), CaseFailure>) {
        let failed = outcome.is_err();
        if let Some(record) = self.table.get_mut(id) {
            record.state = WorkerState::Completed;
            record.in_flight = None;
        }

        match settle(case, outcome) {
            Disposition::Record(case) => self.record(case),
            Disposition::Retry(case) => {
                debug!(case = %case.id, retries = case.retries, "case queued for retry");
                self.run.rerun.push_back(case);
            }
        }

        if self.stopped() {
            self.retire(id, "stop requested");
        } else if failed || self.settings.reload_model {
            self.request_load(id);
        } else {
            if let Some(record) = self.table.get_mut(id) {
                record.state = WorkerState::Ready;
            }
            self.ready(id);
        }
    }

    /// Ask a worker to (re)load the model, shipping the bundle only if
    /// the server does not already hold it.
    fn request_load(&mut self, id: WorkerId) {
        let bundle = self.bundle.clone();
        let Some(record) = self.table.get_mut(id) else {
            return;
        };
        let transfer = record.bundle.as_deref() != Some(bundle.id.as_str());
        debug!(worker = %record.name, transfer, "load model");
        if record.channel.send(Request::Load { bundle, transfer }).is_err() {
            error!(worker = %record.name, "worker gone, retiring");
            record.in_use = false;
        }
    }

    fn retire(&mut self, id: WorkerId, reason: &str) {
        if let Some(record) = self.table.get_mut(id) {
            debug!(worker = %record.name, reason, "worker retired");
            record.in_use = false;
        }
    }

    fn record(&mut self, case: Case) {
        record_case(self.recorder, case);
    }

    /// Record whatever is left when every worker was lost mid-run, so no
    /// case silently disappears.
    fn drain_unassigned(&mut self) {
        if self.stopped() {
            return;
        }
        let mut stranded: Vec<Case> = self
            .run
            .todo
            .drain(..)
            .chain(self.run.rerun.drain(..))
            .collect();
        while let Some(case) = self.run.next_case() {
            stranded.push(case);
        }
        if stranded.is_empty() {
            return;
        }

        error!(cases = stranded.len(), "no workers left, recording remaining cases as failed");
        for mut case in stranded {
            case.msg = Some(NO_WORKER_MSG.to_string());
            self.record(case);
        }
    }

    fn log_idle_timeout(&self) {
        error!("timeout waiting with nothing left to do");
        for (_, record) in self.table.iter().filter(|(_, r)| r.in_use) {
            match &record.info {
                Some(info) => error!(
                    worker = %record.name,
                    server = %info.name,
                    host = %info.host,
                    pid = info.pid,
                    state = ?record.state,
                    case = ?record.in_flight,
                    "worker still in use"
                ),
                None => error!(worker = %record.name, "no startup reply"),
            }
        }
    }

    /// Send the shutdown sentinel to every worker and wait for the acks.
    async fn shutdown(&mut self) {
        if self.table.len() == 0 {
            return;
        }
        info!(workers = self.table.len(), "shutting down workers");

        let mut pending: HashSet<WorkerId> = self
            .table
            .iter()
            .filter(|(_, record)| record.channel.shutdown())
            .map(|(id, _)| id)
            .collect();

        while !pending.is_empty() {
            let received = match timeout(self.settings.shutdown_timeout, self.replies.recv()).await {
                Ok(Some(notification)) => notification,
                Ok(None) | Err(_) => break,
            };
            match received.reply {
                Reply::ShutdownAck => {
                    pending.remove(&received.worker);
                    if let Some(record) = self.table.get_mut(received.worker) {
                        record.channel.join(&record.name);
                    }
                }
                Reply::Executed { case, outcome } => {
                    warn!(worker = received.worker, case = %case.id, "case finished during shutdown");
                    let case = match settle(case, outcome) {
                        Disposition::Record(case) | Disposition::Retry(case) => case,
                    };
                    self.record(case);
                }
                Reply::Started(_) | Reply::Loaded(_) => {}
            }
        }

        for id in pending {
            if let Some(record) = self.table.get(id) {
                warn!(worker = %record.name, "timeout waiting for worker to shut down");
            }
        }
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }
}
