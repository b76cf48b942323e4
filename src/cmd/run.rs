//! Fleet execution: `conveyor run`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use conveyor::config::FleetConfig;
use conveyor::fleet::{FleetEvent, FleetOrchestrator, FleetSummary, IssueReport};
use conveyor::gates::{AmbiguityGate, ArtifactGate, GateRegistry};
use conveyor::isolation::{HostProvider, IsolationProvider, NegotiationOptions};
use conveyor::issue::IssuesFile;
use conveyor::phase::{PhaseDefinition, load_pipeline, review_response_pipeline};
use conveyor::pipeline::{CommandLauncher, GitCommitManager, IsolationRuntime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// An artifact gate on every phase, plus the ambiguity scan of the first phase's output.
fn default_gates(phases: &[PhaseDefinition]) -> GateRegistry {
    let mut gates = GateRegistry::new();
    for phase in phases {
        gates = gates.register(phase.id, Arc::new(ArtifactGate::new(phase.artifact_file_name())));
    }
    if let Some(first) = phases.first() {
        gates = gates.with_ambiguity_gate(Arc::new(AmbiguityGate::new(first.artifact_file_name())));
    }
    gates
}

fn print_event(event: &FleetEvent) {
    match event {
        FleetEvent::Started { issue } => {
            println!("{} #{}", console::style("started").cyan(), issue);
        }
        FleetEvent::Finished { issue, report } => {
            let label = match report {
                IssueReport::Completed | IssueReport::AlreadyCompleted => {
                    console::style("completed").green()
                }
                IssueReport::CompletedWithFailures { .. } => console::style("partial").yellow(),
                IssueReport::Cancelled => console::style("interrupted").yellow(),
                IssueReport::Failed { .. } | IssueReport::Blocked => console::style("failed").red(),
            };
            match report {
                IssueReport::Failed { error } => println!("{} #{}: {}", label, issue, error),
                IssueReport::CompletedWithFailures { failed_phases } => {
                    println!("{} #{} (failed phases: {:?})", label, issue, failed_phases)
                }
                _ => println!("{} #{}", label, issue),
            }
        }
        FleetEvent::Blocked { issue } => {
            println!("{} #{}", console::style("blocked").red().dim(), issue);
        }
        FleetEvent::Interrupted { in_flight } => {
            println!(
                "{} waiting for {} in-flight issue(s)",
                console::style("interrupted").yellow().bold(),
                in_flight.len()
            );
        }
        FleetEvent::FleetCompleted { .. } => {}
    }
}

fn print_summary(summary: &FleetSummary) {
    println!();
    println!("{}", console::style("Fleet summary").bold());
    println!("  Issues:    {}", summary.total_issues);
    println!("  Completed: {}", summary.completed);
    if summary.skipped > 0 {
        println!("  Skipped:   {} (completed earlier)", summary.skipped);
    }
    println!("  Failed:    {}", summary.failed);
    println!("  Blocked:   {}", summary.blocked);
    if summary.cancelled > 0 {
        println!("  Interrupted: {}", summary.cancelled);
    }
    println!(
        "  Progress:  {:.0}% in {:.1}s",
        summary.completion_percentage(),
        summary.duration.as_secs_f64()
    );
}

pub async fn cmd_run(
    project_dir: &Path,
    issues_file: &Path,
    max_parallel: Option<usize>,
    fresh: bool,
    review_response: bool,
) -> Result<()> {
    let config = FleetConfig::load(project_dir)?.with_cli_args(max_parallel);

    if fresh {
        let state_dir = config.state_dir();
        if state_dir.exists() {
            std::fs::remove_dir_all(&state_dir)
                .with_context(|| format!("Failed to clear {}", state_dir.display()))?;
            tracing::info!(state_dir = %state_dir.display(), "cleared previous run state");
        }
    }

    let issues = IssuesFile::load(issues_file)?.issues;
    let phases = if review_response {
        review_response_pipeline()
    } else {
        load_pipeline(&config.project_dir)?
    };
    let agent = config.agent().clone();

    let host: Arc<dyn IsolationProvider> = Arc::new(HostProvider::new(config.project_dir.clone()));
    let isolation = IsolationRuntime {
        provider: host.clone(),
        policy: config.isolation.policy.clone(),
        options: NegotiationOptions {
            allow_fallback_to_host: config.isolation.allow_fallback_to_host,
            host_provider: Some(host),
        },
    };

    let config = Arc::new(config);
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<FleetEvent>(64);

    let orchestrator = FleetOrchestrator::new(
        config.clone(),
        phases.clone(),
        Arc::new(CommandLauncher::new(agent.command, agent.args)),
    )
    .with_gates(default_gates(&phases))
    .with_isolation(isolation)
    .with_commit_manager(Arc::new(GitCommitManager))
    .with_cancellation(cancel.clone())
    .with_event_channel(tx);

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let result = orchestrator.run(issues).await;
    drop(orchestrator);
    printer.await.ok();

    let summary = result?;
    print_summary(&summary);

    if summary.interrupted() {
        println!();
        println!("Run interrupted. Run the same command again to resume.");
        return Ok(());
    }
    if !summary.all_success() {
        anyhow::bail!(
            "{} issue(s) failed, {} blocked",
            summary.failed,
            summary.blocked
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor::phase::default_pipeline;

    #[test]
    fn test_default_gates_cover_every_phase() {
        let phases = default_pipeline();
        let gates = default_gates(&phases);
        for phase in &phases {
            assert!(gates.has_gate(phase.id));
        }
    }
}
