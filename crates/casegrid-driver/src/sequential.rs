//! Sequential evaluation against the driver's own model.

use tracing::{debug, info, warn};

use crate::driver::{CaseIteratorDriver, RunState, record_case};
use crate::error::DriverResult;
use crate::evaluation::{Disposition, evaluate_guarded, prepare, settle};

impl CaseIteratorDriver {
    /// Evaluate one case inline, picking work in the same order as the
    /// concurrent scheduler: cases already pulled, then pending retries,
    /// then the next case from the source.
    ///
    /// Returns `false` once the pass is exhausted. When nothing is open
    /// or queued (before the first run, or after one completed) the
    /// source is reopened for a fresh pass.
    pub fn step(&mut self) -> DriverResult<bool> {
        self.stop.reset();
        if !self.run.has_work() {
            debug!(driver = %self.settings.name, "opening case source for a new pass");
            self.run = RunState::open(self.source_cases()?);
        }
        Ok(self.evaluate_next())
    }

    pub(crate) fn run_sequential(&mut self) -> DriverResult<()> {
        info!(driver = %self.settings.name, "evaluating cases sequentially");
        while !self.stop.is_stopped() {
            if !self.evaluate_next() {
                break;
            }
        }
        Ok(())
    }

    fn evaluate_next(&mut self) -> bool {
        let (mut case, rerun) = if let Some(case) = self.run.todo.pop_front() {
            (case, false)
        } else if let Some(case) = self.run.rerun.pop_front() {
            (case, true)
        } else if let Some(case) = self.run.next_case() {
            (case, false)
        } else {
            return false;
        };

        prepare(&mut case, self.settings.max_retries, rerun);
        debug!(case = %case.id, rerun, "evaluating case");
        let outcome = evaluate_guarded(&mut *self.model, &mut case, &self.settings.events);
        if let Err(e) = &outcome {
            warn!(case = %case.id, error = %e, "case failed");
        }

        match settle(case, outcome) {
            Disposition::Record(case) => record_case(&mut self.recorder, case),
            Disposition::Retry(case) => {
                debug!(case = %case.id, retries = case.retries, "case queued for retry");
                self.run.rerun.push_back(case);
            }
        }
        true
    }
}
