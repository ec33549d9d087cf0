//! Worker channel: a dedicated thread and request queue per server.
//!
//! Each worker thread allocates its server, reports startup on the shared
//! reply channel, then executes requests strictly in arrival order until
//! it receives the shutdown sentinel. The server is released exactly once
//! on the way out, including when the loop unwinds.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use casegrid_alloc::{ResourceAllocator, Server};
use casegrid_core::{Case, Model, ResourceRequirements, ServerInfo};
use casegrid_replicate::{Bundle, ModelReplicator};

use crate::error::{DriverError, DriverResult};
use crate::evaluation::{CaseFailure, evaluate_guarded, panic_message};
use crate::table::WorkerId;

/// Work a scheduler can ask of a worker.
pub(crate) enum Request {
    /// Ensure the bundle is on the server (shipping it when `transfer`
    /// is set and the server lacks it), then instantiate a fresh model.
    Load { bundle: Arc<Bundle>, transfer: bool },
    /// Evaluate a case on the loaded model.
    Execute { case: Case, events: Arc<[String]> },
    /// Sentinel: release the server, acknowledge, exit.
    Shutdown,
}

/// A worker's answer to startup or to one request.
pub(crate) enum Reply {
    Started(Result<ServerInfo, String>),
    Loaded(Result<(), String>),
    Executed {
        case: Case,
        outcome: Result<(), CaseFailure>,
    },
    ShutdownAck,
}

pub(crate) struct Notification {
    pub worker: WorkerId,
    pub reply: Reply,
}

/// Scheduler-side end of a worker: its request queue and thread.
pub(crate) struct WorkerChannel {
    requests: mpsc::Sender<Request>,
    handle: Option<JoinHandle<()>>,
}

/// Everything a worker thread needs besides its request queue.
pub(crate) struct WorkerContext {
    pub id: WorkerId,
    pub name: String,
    pub allocator: Arc<dyn ResourceAllocator>,
    pub replicator: Arc<dyn ModelReplicator>,
    pub requirements: ResourceRequirements,
    pub replies: UnboundedSender<Notification>,
}

impl WorkerChannel {
    /// Start a worker thread. Allocation happens on that thread.
    pub fn spawn(ctx: WorkerContext) -> DriverResult<Self> {
        let (tx, rx) = mpsc::channel();
        let name = ctx.name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || service_loop(ctx, rx))
            .map_err(|source| DriverError::Spawn { name, source })?;
        Ok(Self {
            requests: tx,
            handle: Some(handle),
        })
    }

    /// Queue a request. Hands the request back if the worker is gone.
    pub fn send(&self, request: Request) -> Result<(), Request> {
        self.requests.send(request).map_err(|e| e.0)
    }

    /// Queue the shutdown sentinel.
    pub fn shutdown(&self) -> bool {
        self.requests.send(Request::Shutdown).is_ok()
    }

    /// Wait for the thread to exit. Only call after its shutdown ack.
    pub fn join(&mut self, name: &str) {
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                error!(worker = %name, panic = %panic_message(payload.as_ref()), "worker thread panicked");
            }
        }
    }
}

/// An allocated server, returned to its allocator exactly once.
struct Lease {
    allocator: Arc<dyn ResourceAllocator>,
    server: Option<Box<dyn Server>>,
}

impl Lease {
    fn server(&mut self) -> Option<&mut (dyn Server + 'static)> {
        self.server.as_deref_mut()
    }

    fn release(&mut self) {
        if let Some(server) = self.server.take() {
            self.allocator.release(server);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

fn service_loop(ctx: WorkerContext, requests: mpsc::Receiver<Request>) {
    let WorkerContext {
        id,
        name,
        allocator,
        replicator,
        requirements,
        replies,
    } = ctx;
    let notify = |reply: Reply| {
        replies
            .send(Notification { worker: id, reply })
            .is_ok()
    };

    let Some((server, info)) = allocator.allocate(&requirements) else {
        error!(worker = %name, "server allocation failed");
        notify(Reply::Started(Err("server allocation failed".to_string())));
        return;
    };

    let mut lease = Lease {
        allocator,
        server: Some(server),
    };
    info!(worker = %name, server = %info.name, host = %info.host, pid = info.pid, "worker started");
    if !notify(Reply::Started(Ok(info))) {
        debug!(worker = %name, "scheduler gone before startup ack");
        return;
    }

    let mut model: Option<Box<dyn Model>> = None;
    while let Ok(request) = requests.recv() {
        let reply = match request {
            Request::Shutdown => {
                debug!(worker = %name, "releasing server");
                lease.release();
                notify(Reply::ShutdownAck);
                return;
            }
            Request::Load { bundle, transfer } => {
                // Drop the old instance first; a failed load leaves none.
                model = None;
                let outcome = match lease.server() {
                    Some(server) => load_model(server, replicator.as_ref(), &bundle, transfer),
                    None => Err("server already released".to_string()),
                };
                let outcome = outcome.map(|loaded| {
                    model = Some(loaded);
                });
                if let Err(e) = &outcome {
                    error!(worker = %name, bundle = %bundle.id, error = %e, "model load failed");
                }
                Reply::Loaded(outcome)
            }
            Request::Execute { mut case, events } => {
                let outcome = match model.as_deref_mut() {
                    Some(model) => evaluate_guarded(model, &mut case, &events),
                    None => Err(CaseFailure::NotLoaded),
                };
                if let Err(e) = &outcome {
                    warn!(worker = %name, case = %case.id, error = %e, "case failed");
                }
                Reply::Executed { case, outcome }
            }
        };
        if !notify(reply) {
            debug!(worker = %name, "reply channel closed, exiting");
            break;
        }
    }
    debug!(worker = %name, "request queue closed, releasing server");
}

fn load_model(
    server: &mut dyn Server,
    replicator: &dyn ModelReplicator,
    bundle: &Bundle,
    transfer: bool,
) -> Result<Box<dyn Model>, String> {
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
        if transfer && !server.has_bundle(&bundle.id) {
            replicator
                .transfer(bundle, &mut *server)
                .map_err(|e| e.to_string())?;
        }
        server.load_model(&bundle.id).map_err(|e| e.to_string())
    }));
    match attempt {
        Ok(outcome) => outcome,
        Err(payload) => Err(format!("load panicked: {}", panic_message(payload.as_ref()))),
    }
}
