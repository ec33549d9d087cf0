//! Recorders: sinks that receive each finished case exactly once.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::types::Case;

/// Durable sink for finished cases. `record` consumes the case.
pub trait Recorder: Send {
    fn record(&mut self, case: Case) -> anyhow::Result<()>;
}

/// Keeps recorded cases in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    cases: Arc<Mutex<Vec<Case>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far, in recording order.
    pub fn cases(&self) -> Vec<Case> {
        match self.cases.lock() {
            Ok(cases) => cases.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.cases().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Recorder for MemoryRecorder {
    fn record(&mut self, case: Case) -> anyhow::Result<()> {
        self.cases
            .lock()
            .map_err(|_| anyhow::anyhow!("memory recorder lock poisoned"))?
            .push(case);
        Ok(())
    }
}

/// Appends one JSON line per case and flushes after each write.
pub struct JsonLinesRecorder {
    writer: BufWriter<File>,
}

impl JsonLinesRecorder {
    /// Open (creating or truncating) the output file.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl Recorder for JsonLinesRecorder {
    fn record(&mut self, case: Case) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, &case)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
