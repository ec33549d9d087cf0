//! Shared types used across casegrid crates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One input assignment applied to the model before a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub value: Value,
}

impl Assignment {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            index: None,
            value: value.into(),
        }
    }

    pub fn indexed(name: impl Into<String>, index: usize, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            index: Some(index),
            value: value.into(),
        }
    }
}

/// A requested output. `value` stays `None` until the case is harvested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Output {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: None,
            value: None,
        }
    }
}

/// One unit of work: input assignments plus requested outputs.
///
/// A case moves (never copies) between the source, the worker running it,
/// the retry queue and finally the recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<Assignment>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    /// Per-case retry limit; the driver default applies when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retries: u32,
    /// Failure text. `None` on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl Case {
    pub fn new(id: impl Into<String>, inputs: Vec<Assignment>, outputs: Vec<Output>) -> Self {
        Self {
            id: id.into(),
            inputs,
            outputs,
            max_retries: None,
            retries: 0,
            msg: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.msg.is_none()
    }

    /// Harvested value of the named output, if any.
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs
            .iter()
            .find(|o| o.name == name)
            .and_then(|o| o.value.as_ref())
    }

    /// Effective retry limit once the driver default has been applied.
    pub fn retry_limit(&self) -> u32 {
        self.max_retries.unwrap_or(0)
    }
}

/// Descriptive information about an allocated server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub host: String,
    pub pid: u32,
}

/// What a server must provide to run a packaged model.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub runtime_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ResourceRequirements {
    /// Requirements for a model of the given kind built by this crate version.
    pub fn for_model(kind: &str) -> Self {
        Self {
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec![kind.to_string()],
        }
    }
}
