//! Server handle: one allocated execution resource.

use casegrid_core::{Model, ModelError, ServerInfo};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bundle not present on server: {0}")]
    BundleMissing(String),

    #[error("bundle rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// An allocated server able to host one model instance at a time.
pub trait Server: Send {
    fn info(&self) -> &ServerInfo;

    /// Store a bundle payload under `id`, replacing any previous copy.
    fn receive_bundle(&mut self, id: &str, payload: &[u8]) -> Result<(), ServerError>;

    /// Whether a bundle with `id` has been received.
    fn has_bundle(&self, id: &str) -> bool;

    /// Instantiate a fresh model from a previously received bundle.
    fn load_model(&mut self, id: &str) -> Result<Box<dyn Model>, ServerError>;
}
