//! Case sources: lazy sequences of cases, reopened for every run.
//!
//! Exhaustion is reported as `None` from the iterator returned by
//! [`CaseSource::cases`]; a source never signals it through an error.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::types::Case;

/// Iterator over the cases of one run.
pub type CaseIter = Box<dyn Iterator<Item = Case> + Send>;

/// Produces a fresh case iterator for every run.
pub trait CaseSource: Send {
    fn cases(&self) -> anyhow::Result<CaseIter>;
}

/// In-memory list of cases. Cases without an id are numbered `case-<n>`.
#[derive(Debug, Clone, Default)]
pub struct ListCaseSource {
    cases: Vec<Case>,
}

impl ListCaseSource {
    pub fn new(cases: Vec<Case>) -> Self {
        let cases = cases
            .into_iter()
            .enumerate()
            .map(|(i, mut case)| {
                if case.id.is_empty() {
                    case.id = format!("case-{}", i + 1);
                }
                case
            })
            .collect();
        Self { cases }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl CaseSource for ListCaseSource {
    fn cases(&self) -> anyhow::Result<CaseIter> {
        Ok(Box::new(self.cases.clone().into_iter()))
    }
}

/// Reads one JSON-encoded case per line, lazily.
///
/// Blank lines are ignored; lines that fail to parse are logged and skipped.
#[derive(Debug, Clone)]
pub struct JsonLinesCaseSource {
    path: PathBuf,
}

impl JsonLinesCaseSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaseSource for JsonLinesCaseSource {
    fn cases(&self) -> anyhow::Result<CaseIter> {
        let file = File::open(&self.path)?;
        debug!(path = ?self.path, "opened case file");
        Ok(Box::new(JsonLinesIter {
            lines: BufReader::new(file).lines(),
            line_no: 0,
        }))
    }
}

struct JsonLinesIter {
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl Iterator for JsonLinesIter {
    type Item = Case;

    fn next(&mut self) -> Option<Case> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, line = self.line_no + 1, "case file read failed, stopping");
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Case>(&line) {
                Ok(mut case) => {
                    if case.id.is_empty() {
                        case.id = format!("line-{}", self.line_no);
                    }
                    return Some(case);
                }
                Err(e) => {
                    warn!(error = %e, line = self.line_no, "skipping malformed case");
                }
            }
        }
    }
}
