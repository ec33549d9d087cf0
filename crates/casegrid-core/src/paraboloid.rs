//! Built-in paraboloid model.
//!
//! `f_xy = (x-3)^2 + x*y + (y+4)^2 - 3`. Runs fail when either input
//! lies outside `[-limit, limit]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Model, ModelError};

pub const KIND: &str = "paraboloid";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paraboloid {
    pub x: f64,
    pub y: f64,
    pub limit: f64,
    #[serde(default)]
    pub f_xy: f64,
}

impl Default for Paraboloid {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            limit: 1.0e6,
            f_xy: 0.0,
        }
    }
}

impl Paraboloid {
    pub fn with_limit(limit: f64) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// `ModelLoader`-compatible constructor from a snapshot payload.
    pub fn load(payload: &[u8]) -> Result<Box<dyn Model>, ModelError> {
        let model: Paraboloid =
            serde_json::from_slice(payload).map_err(|e| ModelError::Load(e.to_string()))?;
        Ok(Box::new(model))
    }

    fn slot(&mut self, name: &str) -> Result<&mut f64, ModelError> {
        match name {
            "x" => Ok(&mut self.x),
            "y" => Ok(&mut self.y),
            "f_xy" => Ok(&mut self.f_xy),
            _ => Err(ModelError::UnknownVariable(name.to_string())),
        }
    }
}

fn scalar_only(name: &str, index: Option<usize>) -> Result<(), ModelError> {
    match index {
        None | Some(0) => Ok(()),
        Some(index) => Err(ModelError::IndexOutOfRange {
            name: name.to_string(),
            index,
        }),
    }
}

impl Model for Paraboloid {
    fn kind(&self) -> &str {
        KIND
    }

    fn set(&mut self, name: &str, index: Option<usize>, value: Value) -> Result<(), ModelError> {
        scalar_only(name, index)?;
        let number = value.as_f64().ok_or_else(|| ModelError::InvalidValue {
            name: name.to_string(),
            reason: format!("expected a number, got {value}"),
        })?;
        *self.slot(name)? = number;
        Ok(())
    }

    fn get(&self, name: &str, index: Option<usize>) -> Result<Value, ModelError> {
        scalar_only(name, index)?;
        let value = match name {
            "x" => self.x,
            "y" => self.y,
            "f_xy" => self.f_xy,
            _ => return Err(ModelError::UnknownVariable(name.to_string())),
        };
        Ok(Value::from(value))
    }

    fn run(&mut self) -> Result<(), ModelError> {
        if self.x.abs() > self.limit || self.y.abs() > self.limit {
            return Err(ModelError::Execution(format!(
                "input outside [-{limit}, {limit}]: x={}, y={}",
                self.x,
                self.y,
                limit = self.limit
            )));
        }
        let (x, y) = (self.x, self.y);
        self.f_xy = (x - 3.0).powi(2) + x * y + (y + 4.0).powi(2) - 3.0;
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(self).map_err(|e| ModelError::Snapshot(e.to_string()))
    }
}
