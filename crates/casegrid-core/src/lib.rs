pub mod config;
pub mod model;
pub mod paraboloid;
pub mod recorder;
pub mod source;
pub mod types;

pub use config::{CasegridConfig, ConfigError};
pub use model::{Model, ModelError, ModelLoader};
pub use paraboloid::Paraboloid;
pub use recorder::{JsonLinesRecorder, MemoryRecorder, Recorder};
pub use source::{CaseIter, CaseSource, JsonLinesCaseSource, ListCaseSource};
pub use types::*;
