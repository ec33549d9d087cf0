use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use casegrid_alloc::LocalAllocator;
use casegrid_core::paraboloid::KIND;
use casegrid_core::{CaseSource, CasegridConfig, JsonLinesCaseSource, JsonLinesRecorder, Paraboloid};
use casegrid_driver::{CaseIteratorDriver, DriverError, DriverSettings};
use casegrid_replicate::FileReplicator;

use super::init::CONFIG_FILE;

pub struct RunArgs {
    pub cases: PathBuf,
    pub output: PathBuf,
    pub config: Option<PathBuf>,
    pub sequential: bool,
    pub capacity: Option<u32>,
}

/// Counts of recorded cases after a run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let (summary, outcome) = evaluate(&args).await?;
    println!(
        "{} cases recorded: {} succeeded, {} failed → {}",
        summary.total,
        summary.succeeded,
        summary.failed,
        args.output.display()
    );
    Ok(outcome?)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CasegridConfig> {
    match path {
        Some(path) => Ok(CasegridConfig::from_file(path)?),
        None if Path::new(CONFIG_FILE).exists() => Ok(CasegridConfig::from_file(Path::new(CONFIG_FILE))?),
        None => Ok(CasegridConfig::default()),
    }
}

/// Run the paraboloid over the case file. The driver's own outcome is
/// returned alongside the summary so a stopped run still reports what
/// it recorded.
async fn evaluate(args: &RunArgs) -> anyhow::Result<(Summary, Result<(), DriverError>)> {
    let config = load_config(args.config.as_deref())?;
    let mut settings = DriverSettings::from_config(&config)?;
    settings.sequential |= args.sequential;
    let capacity = args.capacity.unwrap_or(config.allocator.capacity) as usize;

    let allocator = Arc::new(LocalAllocator::new(
        capacity,
        vec![KIND.to_string()],
        Arc::new(Paraboloid::load),
    ));
    let replicator = Arc::new(FileReplicator::new(config.replication.staging_dir.clone()));
    let mut driver = CaseIteratorDriver::new(
        settings,
        Box::new(Paraboloid::default()),
        Box::new(JsonLinesCaseSource::new(&args.cases)),
    )
    .with_recorder(Box::new(JsonLinesRecorder::create(&args.output)?))
    .with_servers(allocator, replicator);

    let stop = driver.stop_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after cases in progress");
            stop.stop();
        }
    });

    info!(
        cases = %args.cases.display(),
        sequential = driver.settings().sequential,
        capacity,
        "starting run"
    );
    let outcome = driver.execute().await;
    interrupt.abort();
    if let Err(e) = &outcome {
        warn!(error = %e, "run did not complete");
    }

    // Drop the driver so the recorder's file is closed before reading it back.
    drop(driver);
    Ok((summarize(&args.output)?, outcome))
}

fn summarize(output: &Path) -> anyhow::Result<Summary> {
    let mut summary = Summary::default();
    for case in JsonLinesCaseSource::new(output).cases()? {
        summary.total += 1;
        if case.succeeded() {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_cases(dir: &Path) -> PathBuf {
        let path = dir.join("cases.jsonl");
        let lines = [
            r#"{"id":"a","inputs":[{"name":"x","value":1.0},{"name":"y","value":2.0}],"outputs":[{"name":"f_xy"}]}"#,
            r#"{"id":"b","inputs":[{"name":"x","value":3.0},{"name":"y","value":-4.0}],"outputs":[{"name":"f_xy"}]}"#,
            r#"{"id":"c","inputs":[{"name":"x","value":5e7},{"name":"y","value":0.0}],"outputs":[{"name":"f_xy"}],"max_retries":0}"#,
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    fn args(dir: &Path, sequential: bool) -> RunArgs {
        let config = dir.join(CONFIG_FILE);
        let staging = dir.join("bundles");
        std::fs::write(
            &config,
            format!(
                "[timeouts]\nidle = \"5s\"\nstartup = \"5s\"\n\n[replication]\nstaging_dir = {:?}\n",
                staging.display().to_string()
            ),
        )
        .unwrap();
        RunArgs {
            cases: write_cases(dir),
            output: dir.join("results.jsonl"),
            config: Some(config),
            sequential,
            capacity: Some(2),
        }
    }

    #[tokio::test]
    async fn concurrent_run_summarizes_recorded_cases() {
        let dir = tempfile::tempdir().unwrap();
        let (summary, outcome) = evaluate(&args(dir.path(), false)).await.unwrap();

        outcome.unwrap();
        assert_eq!(
            summary,
            Summary {
                total: 3,
                succeeded: 2,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn sequential_run_writes_results_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(dir.path(), true);
        let (summary, outcome) = evaluate(&args).await.unwrap();

        outcome.unwrap();
        assert_eq!(summary.total, 3);
        let results = std::fs::read_to_string(&args.output).unwrap();
        assert_eq!(results.lines().count(), 3);
        assert!(results.contains("outside [-1000000, 1000000]"));
    }
}
