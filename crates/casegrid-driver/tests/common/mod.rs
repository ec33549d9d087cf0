//! Shared fixtures for driver integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tempfile::TempDir;

use casegrid_alloc::{LocalAllocator, ResourceAllocator, Server};
use casegrid_core::{
    Assignment, Case, ListCaseSource, MemoryRecorder, Model, ModelError, ModelLoader, Output,
    Paraboloid, Recorder, ResourceRequirements, ServerInfo,
};
use casegrid_driver::{CaseIteratorDriver, DriverSettings, StopHandle};
use casegrid_replicate::{Bundle, FileReplicator, ModelReplicator, ReplicationResult};

pub const FLAKY: &str = "flaky";

/// Attempt counts per case key, shared by every instance of a model.
#[derive(Debug, Default)]
pub struct Attempts(Mutex<HashMap<i64, u32>>);

impl Attempts {
    fn bump(&self, key: i64) -> u32 {
        let mut counts = self.0.lock().unwrap();
        let n = counts.entry(key).or_default();
        *n += 1;
        *n
    }

    pub fn of(&self, key: i64) -> u32 {
        self.0.lock().unwrap().get(&key).copied().unwrap_or_default()
    }

    pub fn total(&self) -> u32 {
        self.0.lock().unwrap().values().sum()
    }
}

/// Squares its `key` input, but fails the first `fail_first` attempts
/// for every key. Panics on the key `panic_on`, if set.
pub struct Flaky {
    attempts: Arc<Attempts>,
    fail_first: u32,
    panic_on: Option<i64>,
    key: i64,
    out: Option<i64>,
}

impl Flaky {
    pub fn new(attempts: Arc<Attempts>, fail_first: u32) -> Self {
        Self {
            attempts,
            fail_first,
            panic_on: None,
            key: 0,
            out: None,
        }
    }

    pub fn panicking_on(mut self, key: i64) -> Self {
        self.panic_on = Some(key);
        self
    }

    /// Loader building fresh instances that share `attempts`.
    pub fn loader(attempts: Arc<Attempts>, fail_first: u32, panic_on: Option<i64>) -> Arc<dyn ModelLoader> {
        Arc::new(move |_payload: &[u8]| -> Result<Box<dyn Model>, ModelError> {
            let mut model = Flaky::new(attempts.clone(), fail_first);
            model.panic_on = panic_on;
            Ok(Box::new(model))
        })
    }
}

impl Model for Flaky {
    fn kind(&self) -> &str {
        FLAKY
    }

    fn set(&mut self, name: &str, _index: Option<usize>, value: Value) -> Result<(), ModelError> {
        match name {
            "key" => {
                self.key = value.as_i64().ok_or_else(|| ModelError::InvalidValue {
                    name: name.to_string(),
                    reason: "expected an integer".to_string(),
                })?;
                Ok(())
            }
            _ => Err(ModelError::UnknownVariable(name.to_string())),
        }
    }

    fn get(&self, name: &str, _index: Option<usize>) -> Result<Value, ModelError> {
        match name {
            "key" => Ok(json!(self.key)),
            "out" => self
                .out
                .map(|v| json!(v))
                .ok_or_else(|| ModelError::Execution("not run".to_string())),
            _ => Err(ModelError::UnknownVariable(name.to_string())),
        }
    }

    fn run(&mut self) -> Result<(), ModelError> {
        self.out = None;
        let n = self.attempts.bump(self.key);
        if self.panic_on == Some(self.key) {
            panic!("key {} blew up", self.key);
        }
        if n <= self.fail_first {
            return Err(ModelError::Execution(format!("attempt {n} failed")));
        }
        self.out = Some(self.key * self.key);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, ModelError> {
        Ok(self.fail_first.to_le_bytes().to_vec())
    }
}

/// Loader wrapper counting loads and failing the ones `fail` selects.
pub struct CountingLoader<F> {
    inner: Arc<dyn ModelLoader>,
    loads: Arc<AtomicUsize>,
    fail: F,
}

impl<F> CountingLoader<F>
where
    F: Fn(usize) -> bool + Send + Sync + 'static,
{
    pub fn wrap(inner: Arc<dyn ModelLoader>, fail: F) -> (Arc<dyn ModelLoader>, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let loader = Arc::new(Self {
            inner,
            loads: loads.clone(),
            fail,
        });
        (loader, loads)
    }
}

impl<F> ModelLoader for CountingLoader<F>
where
    F: Fn(usize) -> bool + Send + Sync,
{
    fn load(&self, payload: &[u8]) -> Result<Box<dyn Model>, ModelError> {
        let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        if (self.fail)(n) {
            return Err(ModelError::Load(format!("load {n} refused")));
        }
        self.inner.load(payload)
    }
}

/// Replicator whose first `failures` transfers fail.
pub struct UnreliableReplicator {
    inner: FileReplicator,
    failures: AtomicUsize,
}

impl UnreliableReplicator {
    pub fn new(inner: FileReplicator, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

impl ModelReplicator for UnreliableReplicator {
    fn package(&self, name: &str, version: &str, model: &dyn Model) -> ReplicationResult<Bundle> {
        self.inner.package(name, version, model)
    }

    fn transfer(&self, bundle: &Bundle, server: &mut dyn Server) -> ReplicationResult<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            let missing = bundle.path.with_extension("missing");
            let broken = Bundle {
                path: missing,
                ..bundle.clone()
            };
            return self.inner.transfer(&broken, server);
        }
        self.inner.transfer(bundle, server)
    }

    fn remove(&self, bundle: &Bundle) -> ReplicationResult<()> {
        self.inner.remove(bundle)
    }
}

/// Claims capacity but never manages to allocate a server.
pub struct RefusingAllocator;

impl ResourceAllocator for RefusingAllocator {
    fn max_servers(&self, _requirements: &ResourceRequirements) -> i64 {
        2
    }

    fn allocate(&self, _requirements: &ResourceRequirements) -> Option<(Box<dyn Server>, ServerInfo)> {
        None
    }

    fn release(&self, _server: Box<dyn Server>) {}
}

/// Wraps a `LocalAllocator`; whichever worker allocates first sleeps for
/// `delay` before getting its server.
pub struct SlowFirstAllocator {
    pub inner: LocalAllocator,
    delay: Duration,
    delayed: AtomicBool,
}

impl SlowFirstAllocator {
    pub fn new(inner: LocalAllocator, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            delayed: AtomicBool::new(false),
        }
    }
}

impl ResourceAllocator for SlowFirstAllocator {
    fn max_servers(&self, requirements: &ResourceRequirements) -> i64 {
        self.inner.max_servers(requirements)
    }

    fn allocate(&self, requirements: &ResourceRequirements) -> Option<(Box<dyn Server>, ServerInfo)> {
        if !self.delayed.swap(true, Ordering::SeqCst) {
            std::thread::sleep(self.delay);
        }
        self.inner.allocate(requirements)
    }

    fn release(&self, server: Box<dyn Server>) {
        self.inner.release(server)
    }
}

/// Delegates to another model, sleeping `delay` in every run.
pub struct Sluggish {
    inner: Box<dyn Model>,
    delay: Duration,
}

impl Sluggish {
    pub fn loader(inner: Arc<dyn ModelLoader>, delay: Duration) -> Arc<dyn ModelLoader> {
        Arc::new(move |payload: &[u8]| -> Result<Box<dyn Model>, ModelError> {
            Ok(Box::new(Sluggish {
                inner: inner.load(payload)?,
                delay,
            }))
        })
    }
}

impl Model for Sluggish {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    fn set(&mut self, name: &str, index: Option<usize>, value: Value) -> Result<(), ModelError> {
        self.inner.set(name, index, value)
    }

    fn get(&self, name: &str, index: Option<usize>) -> Result<Value, ModelError> {
        self.inner.get(name, index)
    }

    fn run(&mut self) -> Result<(), ModelError> {
        std::thread::sleep(self.delay);
        self.inner.run()
    }

    fn snapshot(&self) -> Result<Vec<u8>, ModelError> {
        self.inner.snapshot()
    }
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn eventually(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Records into a `MemoryRecorder` and requests a stop once `after`
/// cases have been recorded.
pub struct StopAfter {
    pub inner: MemoryRecorder,
    pub handle: StopHandle,
    pub after: usize,
}

impl Recorder for StopAfter {
    fn record(&mut self, case: Case) -> anyhow::Result<()> {
        self.inner.record(case)?;
        if self.inner.len() == self.after {
            self.handle.stop();
        }
        Ok(())
    }
}

pub fn settings() -> DriverSettings {
    DriverSettings {
        name: "test".to_string(),
        idle_timeout: Duration::from_secs(5),
        startup_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        ..DriverSettings::default()
    }
}

/// Cases `key = 1..=n`, each asking for `out`.
pub fn keyed_cases(n: i64) -> Vec<Case> {
    (1..=n)
        .map(|k| {
            Case::new(
                format!("case-{k}"),
                vec![Assignment::new("key", k)],
                vec![Output::new("out")],
            )
        })
        .collect()
}

pub fn paraboloid_cases(points: &[(f64, f64)]) -> Vec<Case> {
    points
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| {
            Case::new(
                format!("p{i}"),
                vec![Assignment::new("x", x), Assignment::new("y", y)],
                vec![Output::new("f_xy")],
            )
        })
        .collect()
}

pub fn paraboloid(x: f64, y: f64) -> f64 {
    (x - 3.0).powi(2) + x * y + (y + 4.0).powi(2) - 3.0
}

/// Staging directory, allocator and recorder for one test run.
pub struct Harness {
    pub dir: TempDir,
    pub allocator: Arc<LocalAllocator>,
    pub replicator: Arc<FileReplicator>,
    pub recorder: MemoryRecorder,
}

impl Harness {
    pub fn new(capacity: usize, kind: &str, loader: Arc<dyn ModelLoader>) -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            allocator: Arc::new(LocalAllocator::new(capacity, vec![kind.to_string()], loader)),
            replicator: Arc::new(FileReplicator::new(dir.path().join("bundles"))),
            recorder: MemoryRecorder::new(),
            dir,
        }
    }

    pub fn flaky(capacity: usize, attempts: &Arc<Attempts>, fail_first: u32) -> Self {
        Self::new(capacity, FLAKY, Flaky::loader(attempts.clone(), fail_first, None))
    }

    pub fn paraboloid(capacity: usize) -> Self {
        Self::new(capacity, casegrid_core::paraboloid::KIND, Arc::new(Paraboloid::load))
    }

    /// A concurrent driver over `cases` wired to this harness.
    pub fn driver(&self, settings: DriverSettings, model: Box<dyn Model>, cases: Vec<Case>) -> CaseIteratorDriver {
        CaseIteratorDriver::new(settings, model, Box::new(ListCaseSource::new(cases)))
            .with_recorder(Box::new(self.recorder.clone()))
            .with_servers(self.allocator.clone(), self.replicator.clone())
    }

    pub fn staged_bundles(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("bundles"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// Asserts no case id was recorded twice and returns the recorded ids.
pub fn unique_ids(cases: &[Case]) -> HashSet<String> {
    let ids: HashSet<String> = cases.iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids.len(), cases.len(), "a case was recorded more than once");
    ids
}
