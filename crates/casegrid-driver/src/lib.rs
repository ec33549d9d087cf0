//! casegrid-driver: drive a stream of cases through a model.
//!
//! `CaseIteratorDriver` pulls cases from a `CaseSource`, evaluates each
//! one, and hands every finished case to a `Recorder` exactly once.
//! Evaluation is either sequential (inline, against the local model) or
//! concurrent across servers obtained from a `ResourceAllocator`:
//!
//! - The local model is packaged into a bundle once per run
//! - Each server gets a dedicated worker thread and request queue
//! - A single reply channel carries every worker's notifications back
//!   to the scheduler, which advances that worker's state machine
//! - Failed cases are retried (ahead of fresh cases) up to their limit
//! - Every allocated server is released, whatever happens
//!
//! # Architecture
//!
//! ```text
//! CaseIteratorDriver
//!   ├── CaseSource → RunState (cursor, todo, rerun)
//!   ├── sequential: evaluate inline on the local Model
//!   └── concurrent: CaseScheduler
//!       ├── WorkerTable (id → WorkerRecord + WorkerState)
//!       ├── WorkerChannel per server (request queue + thread)
//!       └── reply channel (all workers → scheduler)
//! ```

pub mod driver;
pub mod error;
pub mod evaluation;
mod scheduler;
mod sequential;
pub mod table;
mod worker;

pub use driver::{CaseIteratorDriver, DriverSettings, StopHandle};
pub use error::{DriverError, DriverResult};
pub use evaluation::CaseFailure;
pub use table::WorkerState;
