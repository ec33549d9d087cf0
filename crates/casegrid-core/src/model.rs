//! Model interface: the simulation a case is evaluated against.
//!
//! How a model computes its outputs is its own business; the driver only
//! needs to set inputs, run it, read outputs back, and snapshot its
//! state so it can be replicated onto remote servers.

use serde_json::Value;
use thiserror::Error;

/// Errors raised by a model instance.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no such variable: {0}")]
    UnknownVariable(String),

    #[error("index {index} out of range for '{name}'")]
    IndexOutOfRange { name: String, index: usize },

    #[error("invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("{0}")]
    Execution(String),

    #[error("failed to load model: {0}")]
    Load(String),

    #[error("failed to snapshot model: {0}")]
    Snapshot(String),
}

/// A model instance. One instance is only ever driven by one thread.
pub trait Model: Send {
    /// Model kind, used as the capability a server must support.
    fn kind(&self) -> &str;

    fn set(&mut self, name: &str, index: Option<usize>, value: Value) -> Result<(), ModelError>;

    fn get(&self, name: &str, index: Option<usize>) -> Result<Value, ModelError>;

    /// Execute the model with its current inputs.
    fn run(&mut self) -> Result<(), ModelError>;

    /// Serialize current state into a payload a `ModelLoader` can rebuild.
    fn snapshot(&self) -> Result<Vec<u8>, ModelError>;
}

/// Rebuilds model instances from a bundle payload.
pub trait ModelLoader: Send + Sync {
    fn load(&self, payload: &[u8]) -> Result<Box<dyn Model>, ModelError>;
}

impl<F> ModelLoader for F
where
    F: Fn(&[u8]) -> Result<Box<dyn Model>, ModelError> + Send + Sync,
{
    fn load(&self, payload: &[u8]) -> Result<Box<dyn Model>, ModelError> {
        self(payload)
    }
}
