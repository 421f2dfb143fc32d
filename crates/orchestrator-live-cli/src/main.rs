//! Watch workflow runs and preview/apply document patches from a terminal.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use orchestrator_live::prelude::*;
use orchestrator_live::{RunSnapshot, init_observability};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "orchestrator-live", version)]
#[command(about = "Drive workflow runs and propose document patches", long_about = None)]
struct Cli {
    /// Workflow server base URL
    #[arg(long, env = "ORCHESTRATOR_LIVE_BASE_URL", default_value = "http://localhost:8080")]
    base_url: String,

    /// Bearer token sent with every request
    #[arg(long, env = "ORCHESTRATOR_LIVE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Seconds a stream may stay silent before polling takes over
    #[arg(long, env = "ORCHESTRATOR_LIVE_HEALTH_WINDOW_SECS", default_value_t = 15)]
    health_window_secs: u64,

    /// Seconds between watchdog ticks
    #[arg(long, env = "ORCHESTRATOR_LIVE_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,

    /// Poll `<runs>/<id>/status` instead of `<runs>/<id>`
    #[arg(long)]
    status_suffix: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a run and follow it until it finishes (Ctrl-C cancels it)
    Watch {
        workflow_id: String,
        /// Run inputs as a JSON document
        #[arg(long)]
        inputs: Option<String>,
    },
    /// Poll a run's status once
    Status { run_id: String },
    /// Preview (default) or apply a full-replace patch
    Patch {
        /// Resource path, e.g. `api/workflows/<id>`
        resource: String,
        /// Revision the new content was written against
        #[arg(long)]
        base: String,
        /// File holding the new document body
        #[arg(long)]
        replace: PathBuf,
        /// Commit instead of dry-running
        #[arg(long)]
        apply: bool,
    },
}

fn config_from(cli: &Cli) -> ClientConfig {
    let mut config = ClientConfig::new(&cli.base_url)
        .health_window(Duration::from_secs(cli.health_window_secs))
        .poll_interval(Duration::from_secs(cli.poll_interval_secs))
        .status_suffix(cli.status_suffix);
    if let Some(token) = cli.token.as_deref().filter(|t| !t.trim().is_empty()) {
        config = config.bearer_token(token);
    }
    config
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_observability();

    let client = RunClient::builder(config_from(&cli)).build()?;
    match cli.command {
        Command::Watch {
            workflow_id,
            inputs,
        } => {
            let inputs = inputs
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()
                .map_err(|e| ClientError::Validation(format!("--inputs is not valid JSON: {e}")))?;
            watch(&client, WorkflowId::new(workflow_id), inputs).await
        }
        Command::Status { run_id } => {
            let snapshot = client.fetch_run(&RunId::new(run_id)).await?;
            print_snapshot(&snapshot);
            Ok(ExitCode::SUCCESS)
        }
        Command::Patch {
            resource,
            base,
            replace,
            apply,
        } => {
            let content = std::fs::read_to_string(&replace)
                .map_err(|e| format!("cannot read {}: {e}", replace.display()))?;
            let patch = ProposedPatch::full_replace(RevisionToken::new(base), content);
            patch_document(&client.patches(resource), &patch, apply).await
        }
    }
}

async fn watch(
    client: &RunClient,
    workflow_id: WorkflowId,
    inputs: Option<serde_json::Value>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let run = client.start_run(workflow_id, inputs).await?;
    let mut views = run.subscribe();
    print_view(&views.borrow_and_update());

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                print_view(&view);
                if view.state.phase().is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, cancelling run");
                if let Err(err) = run.cancel().await {
                    warn!(error = %err, "cancel failed");
                    break;
                }
            }
        }
    }

    let state = run.shutdown().await?;
    for step in state.steps() {
        println!(
            "  {:<24} {:?} ({:?}){}",
            step.node_id,
            step.status,
            step.origin,
            step.error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
        );
    }
    Ok(if state.phase() == RunPhase::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_view(view: &RunView) {
    let state = &view.state;
    let progress = state
        .progress()
        .map(|p| format!("{p:>5.1}%"))
        .unwrap_or_else(|| "    - ".to_string());
    let mut line = format!(
        "[{}] {progress} run={} step={}",
        state.phase(),
        state.id().map(|id| id.as_str()).unwrap_or("?"),
        state.current_step().unwrap_or("-"),
    );
    if !view.streaming && !state.phase().is_terminal() {
        line.push_str(" (polling)");
    }
    if let Some(error) = state.error() {
        line.push_str(&format!(" error={error}"));
    }
    println!("{line}");
}

fn print_snapshot(snapshot: &RunSnapshot) {
    println!("status:   {:?}", snapshot.status);
    if let Some(progress) = snapshot.progress {
        println!("progress: {progress:.1}%");
    }
    if let Some(node) = &snapshot.current_node {
        println!("step:     {node}");
    }
    if let Some(error) = &snapshot.error {
        println!("error:    {error}");
    }
}

fn render_diff(diff: &Option<serde_json::Value>) -> String {
    match diff {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(other) => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        None => "(no diff)".to_string(),
    }
}

fn print_preview(preview: &PreviewOutcome) {
    if let Some(from) = &preview.rebased_from {
        println!("document changed since {from}; preview rebased onto {}", preview.base_revision);
    }
    println!("{}", render_diff(&preview.diff));
    if !preview.valid {
        println!("invalid:");
        for error in &preview.validation_errors {
            println!("  - {error}");
        }
        if let Some(error) = &preview.error {
            println!("  - {error}");
        }
    }
}

async fn patch_document(
    coordinator: &PatchCoordinator,
    patch: &ProposedPatch,
    apply: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    if !apply {
        let preview = coordinator.preview(patch).await?;
        print_preview(&preview);
        return Ok(if preview.valid {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    match coordinator.apply(patch).await {
        Ok(ApplyOutcome::Applied { new_revision, diff }) => {
            println!("{}", render_diff(&diff));
            println!("applied, new revision {new_revision}");
            Ok(ExitCode::SUCCESS)
        }
        Ok(ApplyOutcome::Rebased { preview }) => {
            print_preview(&preview);
            println!("not applied; re-run with --base {} to commit", preview.base_revision);
            Ok(ExitCode::FAILURE)
        }
        Err(PatchError::Validation { errors }) => {
            for error in errors {
                eprintln!("  - {error}");
            }
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}
