//! The case iterator driver.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use casegrid_alloc::ResourceAllocator;
use casegrid_core::{Case, CaseIter, CaseSource, CasegridConfig, ConfigError, Model, Recorder};
use casegrid_replicate::{Bundle, ModelReplicator};

use crate::error::{DriverError, DriverResult};
use crate::scheduler::CaseScheduler;

/// Tunables for one driver.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Driver name; worker threads are named `<name>-<n>`.
    pub name: String,
    /// Evaluate inline against the local model instead of on servers.
    pub sequential: bool,
    /// Reload the model on a server after every case.
    pub reload_model: bool,
    /// Retry limit for cases that don't carry their own.
    pub max_retries: u32,
    /// Variables set to `true` before each case runs.
    pub events: Vec<String>,
    pub idle_timeout: Duration,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Consecutive reload failures before a worker is retired.
    pub max_reload_attempts: u32,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            name: "driver".to_string(),
            sequential: false,
            reload_model: true,
            max_retries: 1,
            events: Vec::new(),
            idle_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(1),
            max_reload_attempts: 3,
        }
    }
}

impl DriverSettings {
    pub fn from_config(config: &CasegridConfig) -> Result<Self, ConfigError> {
        let driver = &config.driver;
        Ok(Self {
            name: driver.name.clone(),
            sequential: driver.sequential,
            reload_model: driver.reload_model,
            max_retries: driver.max_retries,
            events: driver.events.clone(),
            idle_timeout: config.timeouts.idle()?,
            startup_timeout: config.timeouts.startup()?,
            shutdown_timeout: config.timeouts.shutdown()?,
            max_reload_attempts: config.timeouts.max_reload_attempts,
        })
    }
}

/// Requests a cooperative stop of a running driver.
///
/// Cloneable and usable from any task or thread. A stop takes effect at
/// the next point where the driver would pick up a case; cases already
/// running are finished and recorded.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Where a run is: the open source cursor plus the two pending queues.
#[derive(Default)]
pub(crate) struct RunState {
    /// `None` once the source is exhausted (or before setup).
    pub iter: Option<CaseIter>,
    /// Cases pulled during worker startup, assigned before anything else.
    pub todo: VecDeque<Case>,
    /// Failed cases awaiting another attempt.
    pub rerun: VecDeque<Case>,
}

impl RunState {
    pub fn open(iter: CaseIter) -> Self {
        Self {
            iter: Some(iter),
            ..Self::default()
        }
    }

    /// Next fresh case from the source. Drops the cursor when exhausted.
    pub fn next_case(&mut self) -> Option<Case> {
        let next = self.iter.as_mut()?.next();
        if next.is_none() {
            self.iter = None;
        }
        next
    }

    pub fn exhausted(&self) -> bool {
        self.iter.is_none()
    }

    pub fn has_work(&self) -> bool {
        !self.todo.is_empty() || !self.rerun.is_empty() || !self.exhausted()
    }
}

/// Hand a finished case to the recorder. Recorder failures are logged
/// and never abort the run.
pub(crate) fn record_case(recorder: &mut Option<Box<dyn Recorder>>, case: Case) {
    let Some(recorder) = recorder.as_mut() else {
        return;
    };
    let id = case.id.clone();
    if let Err(e) = recorder.record(case) {
        error!(case = %id, error = %e, "failed to record case");
    }
}

/// Runs a model over every case from a source and records the results.
///
/// ```text
/// setup ──▶ resume ──▶ (sequential | CaseScheduler) ──▶ cleanup
///   ▲          │
///   └── step ──┘   (sequential, one case at a time)
/// ```
pub struct CaseIteratorDriver {
    pub(crate) settings: DriverSettings,
    pub(crate) model: Box<dyn Model>,
    source: Box<dyn CaseSource>,
    pub(crate) recorder: Option<Box<dyn Recorder>>,
    allocator: Option<Arc<dyn ResourceAllocator>>,
    replicator: Option<Arc<dyn ModelReplicator>>,
    replicants: u32,
    bundle: Option<Arc<Bundle>>,
    pub(crate) run: RunState,
    pub(crate) stop: StopHandle,
}

impl CaseIteratorDriver {
    pub fn new(settings: DriverSettings, model: Box<dyn Model>, source: Box<dyn CaseSource>) -> Self {
        Self {
            settings,
            model,
            source,
            recorder: None,
            allocator: None,
            replicator: None,
            replicants: 0,
            bundle: None,
            run: RunState::default(),
            stop: StopHandle::new(),
        }
    }

    pub fn with_recorder(mut self, recorder: Box<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Servers for concurrent evaluation, and the replicator that ships
    /// the model to them.
    pub fn with_servers(
        mut self,
        allocator: Arc<dyn ResourceAllocator>,
        replicator: Arc<dyn ModelReplicator>,
    ) -> Self {
        self.allocator = Some(allocator);
        self.replicator = Some(replicator);
        self
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// The bundle servers load the model from, once packaged.
    pub fn bundle(&self) -> Option<&Bundle> {
        self.bundle.as_deref()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Ask a running driver to stop picking up new cases.
    pub fn stop(&self) {
        info!(driver = %self.settings.name, "stop requested");
        self.stop.stop();
    }

    /// Prepare a fresh run: package the model when evaluating
    /// concurrently, then open the case source.
    ///
    /// With `replicate` unset, an existing bundle is reused.
    pub fn setup(&mut self, replicate: bool) -> DriverResult<()> {
        self.cleanup(replicate);
        if !self.settings.sequential && (replicate || self.bundle.is_none()) {
            self.replicate()?;
        }
        self.run = RunState::open(self.source_cases()?);
        debug!(driver = %self.settings.name, "case source opened");
        Ok(())
    }

    /// Evaluate the remaining cases.
    ///
    /// Cleanup runs whatever the outcome, removing the bundle when
    /// `remove_bundle` is set. Cleanup does not clear the source cursor
    /// or the pending and retry queues: cases a stopped run did not get
    /// to stay queued, and the next `resume` picks up where it left off.
    /// Call `setup` to discard them and start over.
    pub async fn resume(&mut self, remove_bundle: bool) -> DriverResult<()> {
        if !self.run.has_work() {
            return Err(DriverError::RunComplete);
        }
        self.stop.reset();

        let result = if self.settings.sequential {
            self.run_sequential()
        } else {
            self.run_concurrent().await
        };
        self.cleanup(remove_bundle);
        result?;

        if self.stop.is_stopped() {
            warn!(driver = %self.settings.name, "run stopped before completion");
            return Err(DriverError::Stopped);
        }
        info!(driver = %self.settings.name, "run complete");
        Ok(())
    }

    pub(crate) fn source_cases(&self) -> DriverResult<CaseIter> {
        Ok(self.source.cases()?)
    }

    /// `setup(true)` followed by `resume(true)`.
    pub async fn execute(&mut self) -> DriverResult<()> {
        self.setup(true)?;
        self.resume(true).await
    }

    async fn run_concurrent(&mut self) -> DriverResult<()> {
        let allocator = self
            .allocator
            .clone()
            .ok_or(DriverError::NotConfigured("a resource allocator"))?;
        let replicator = self
            .replicator
            .clone()
            .ok_or(DriverError::NotConfigured("a model replicator"))?;
        let bundle = match &self.bundle {
            Some(bundle) => bundle.clone(),
            None => self.replicate()?,
        };

        CaseScheduler::new(
            &self.settings,
            allocator,
            replicator,
            bundle,
            &mut self.run,
            &mut self.recorder,
            self.stop.subscribe(),
        )
        .run()
        .await
    }

    /// Package the local model as a new bundle for the servers.
    fn replicate(&mut self) -> DriverResult<Arc<Bundle>> {
        let replicator = self
            .replicator
            .clone()
            .ok_or(DriverError::NotConfigured("a model replicator"))?;
        self.replicants += 1;
        let version = format!("replicant.{}", self.replicants);
        let bundle = Arc::new(replicator.package(&self.settings.name, &version, &*self.model)?);
        debug!(driver = %self.settings.name, bundle = %bundle.id, %version, "replicated model");
        self.bundle = Some(bundle.clone());
        Ok(bundle)
    }

    /// End-of-run cleanup. Only touches the bundle; the run state is
    /// kept for `resume` and replaced by `setup`.
    fn cleanup(&mut self, remove_bundle: bool) {
        if !remove_bundle {
            return;
        }
        let (Some(bundle), Some(replicator)) = (self.bundle.take(), self.replicator.as_ref()) else {
            return;
        };
        match replicator.remove(&bundle) {
            Ok(()) => debug!(bundle = %bundle.id, "bundle removed"),
            Err(e) => warn!(bundle = %bundle.id, error = %e, "failed to remove bundle"),
        }
    }
}
