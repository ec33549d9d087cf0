//! Evaluating one case against a model, and the retry policy.
//!
//! Both the sequential path and every worker thread evaluate cases
//! through [`evaluate`], so the two modes produce identical results for
//! a deterministic model.

use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;
use thiserror::Error;

use casegrid_core::{Case, Model, ModelError};

/// Why a single attempt at a case failed.
#[derive(Debug, Error)]
pub enum CaseFailure {
    #[error("Exception setting '{name}': {source}")]
    Input {
        name: String,
        #[source]
        source: ModelError,
    },

    #[error("{0}")]
    Execution(#[source] ModelError),

    #[error("Exception getting '{name}': {source}")]
    Output {
        name: String,
        #[source]
        source: ModelError,
    },

    #[error("model panicked: {0}")]
    Panic(String),

    #[error("no model loaded")]
    NotLoaded,
}

/// Set events and inputs, run the model, and harvest the requested outputs.
///
/// Outputs that can be read are filled in even when another output fails;
/// the first harvest failure is reported.
pub fn evaluate(model: &mut dyn Model, case: &mut Case, events: &[String]) -> Result<(), CaseFailure> {
    for event in events {
        model
            .set(event, None, Value::Bool(true))
            .map_err(|source| CaseFailure::Input {
                name: event.clone(),
                source,
            })?;
    }
    for input in &case.inputs {
        model
            .set(&input.name, input.index, input.value.clone())
            .map_err(|source| CaseFailure::Input {
                name: input.name.clone(),
                source,
            })?;
    }

    model.run().map_err(CaseFailure::Execution)?;

    let mut first_failure = None;
    for output in &mut case.outputs {
        match model.get(&output.name, output.index) {
            Ok(value) => output.value = Some(value),
            Err(source) => {
                if first_failure.is_none() {
                    first_failure = Some(CaseFailure::Output {
                        name: output.name.clone(),
                        source,
                    });
                }
            }
        }
    }
    match first_failure {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

/// [`evaluate`], with a panicking model reported as a failure.
///
/// The case survives the panic, so it is never lost.
pub(crate) fn evaluate_guarded(
    model: &mut dyn Model,
    case: &mut Case,
    events: &[String],
) -> Result<(), CaseFailure> {
    match panic::catch_unwind(AssertUnwindSafe(|| evaluate(model, case, events))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(CaseFailure::Panic(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Reset a case before an attempt.
///
/// Fresh cases pick up the driver's retry limit if they carry none and
/// start with a zero retry count; reruns keep their count.
pub(crate) fn prepare(case: &mut Case, default_max_retries: u32, rerun: bool) {
    if !rerun {
        if case.max_retries.is_none() {
            case.max_retries = Some(default_max_retries);
        }
        case.retries = 0;
    }
    case.msg = None;
}

/// What to do with a case after an attempt.
#[derive(Debug)]
pub(crate) enum Disposition {
    Record(Case),
    Retry(Case),
}

/// Apply the retry policy to the outcome of an attempt.
pub(crate) fn settle(mut case: Case, outcome: Result<(), CaseFailure>) -> Disposition {
    match outcome {
        Ok(()) => {
            case.msg = None;
            Disposition::Record(case)
        }
        Err(failure) => {
            case.msg = Some(failure.to_string());
            if case.retries < case.retry_limit() {
                case.retries += 1;
                Disposition::Retry(case)
            } else {
                Disposition::Record(case)
            }
        }
    }
}
