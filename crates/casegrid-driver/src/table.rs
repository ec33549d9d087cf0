//! Worker table: the scheduler's arena of worker records.
//!
//! Records are indexed by a stable `WorkerId` (their position in the
//! arena) and are only mutated by the scheduler task. Workers never see
//! the table; they talk to the scheduler through their channels.

use casegrid_core::ServerInfo;

use crate::worker::WorkerChannel;

pub type WorkerId = usize;

/// Per-worker state. Transitions happen when the worker's replies arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Started; no model loaded yet.
    Empty,
    /// Model loaded; ready for (or running) a case.
    Ready,
    /// A case finished; results harvested, model possibly reloading.
    Completed,
    /// Model load failed; reload pending.
    Error,
}

pub(crate) struct WorkerRecord {
    pub name: String,
    pub state: WorkerState,
    /// Still taking part in the run.
    pub in_use: bool,
    /// Set once the startup acknowledgment arrives.
    pub info: Option<ServerInfo>,
    /// Bundle currently loaded on the server.
    pub bundle: Option<String>,
    /// Id of the case the worker is running.
    pub in_flight: Option<String>,
    pub reload_failures: u32,
    pub channel: WorkerChannel,
}

impl WorkerRecord {
    pub fn new(name: String, channel: WorkerChannel) -> Self {
        Self {
            name,
            state: WorkerState::Empty,
            in_use: true,
            info: None,
            bundle: None,
            in_flight: None,
            reload_failures: 0,
            channel,
        }
    }
}

#[derive(Default)]
pub(crate) struct WorkerTable {
    records: Vec<WorkerRecord>,
}

impl WorkerTable {
    pub fn insert(&mut self, record: WorkerRecord) -> WorkerId {
        self.records.push(record);
        self.records.len() - 1
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
        self.records.get_mut(id)
    }

    /// True while at least one worker is in use.
    pub fn busy(&self) -> bool {
        self.records.iter().any(|r| r.in_use)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn ids(&self) -> std::ops::Range<WorkerId> {
        0..self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WorkerId, &WorkerRecord)> {
        self.records.iter().enumerate()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (WorkerId, &mut WorkerRecord)> {
        self.records.iter_mut().enumerate()
    }
}
