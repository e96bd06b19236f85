use std::panic;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use scriptrunner::{
    BatchSummary, RunOptions, Runtime, RuntimeConfig, TestCase, TestCaseResult, TestStatus,
    core::pipeline::batch::BatchSubmission,
};

#[derive(Parser, Debug)]
#[command(
    name = "scriptrunner",
    version,
    about = "Run Lua scripts and test cases in an isolated interpreter"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a script once and print the result as JSON
    Run {
        file: PathBuf,

        #[arg(long, help = "Function to call after the script has been loaded")]
        entry: Option<String>,

        #[arg(long)]
        timeout_ms: Option<u64>,

        #[arg(long, help = "JSON array of arguments passed to the entry function")]
        args: Option<String>,
    },
    /// Check a solution against a JSON file of test cases
    Test {
        file: PathBuf,

        #[arg(long)]
        entry: String,

        #[arg(long, help = "JSON array of {id, input, expected_output, hidden}")]
        cases: PathBuf,

        #[arg(long, help = "Timeout of every single case")]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let cli = Cli::parse();
    let runtime = Runtime::with_lua(RuntimeConfig::from_env());
    runtime.initialize().await?;
    abort_on_ctrl_c(runtime.clone());

    match cli.command {
        Command::Run {
            file,
            entry,
            timeout_ms,
            args,
        } => {
            let code = read_source(&file).await?;
            let args = match args {
                Some(raw) => serde_json::from_str::<Vec<serde_json::Value>>(&raw)
                    .context("--args must be a JSON array")?,
                None => Vec::new(),
            };
            let options = RunOptions {
                entry_point: entry,
                timeout_ms,
                args,
            };

            let result = runtime.run_code(&code, options).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);

            Ok(exit_code(result.success))
        }
        Command::Test {
            file,
            entry,
            cases,
            timeout_ms,
        } => {
            let code = read_source(&file).await?;
            let raw_cases = read_source(&cases).await?;
            let test_cases: Vec<TestCase> = serde_json::from_str(&raw_cases)
                .with_context(|| format!("invalid test cases in {}", cases.display()))?;

            let (progress_tx, progress_rx) = mpsc::channel(test_cases.len() * 2 + 2);
            let reporter = tokio::spawn(report_progress(progress_rx));

            let submission = BatchSubmission {
                code: &code,
                entry_point: &entry,
                test_cases: &test_cases,
                timeout_ms,
            };
            let results = runtime
                .run_batch_with_progress(submission, Some(&progress_tx))
                .await?;
            drop(progress_tx);
            reporter.await?;

            let summary = BatchSummary::from_results(&results);
            let shown: Vec<TestCaseResult> = results.iter().map(TestCaseResult::redacted).collect();
            let report = serde_json::json!({ "summary": summary, "results": shown });
            println!("{}", serde_json::to_string_pretty(&report)?);

            Ok(exit_code(summary.all_passed()))
        }
    }
}

async fn read_source(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))
}

async fn report_progress(mut progress_rx: mpsc::Receiver<Vec<TestCaseResult>>) {
    while let Some(snapshot) = progress_rx.recv().await {
        let finished = snapshot
            .iter()
            .filter(|r| matches!(r.status, TestStatus::Passed | TestStatus::Failed))
            .count();
        tracing::info!("Progress: {}/{} cases finished", finished, snapshot.len());
    }
}

fn abort_on_ctrl_c(runtime: Runtime) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, aborting current execution");
            runtime.abort();
        }
    });
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
