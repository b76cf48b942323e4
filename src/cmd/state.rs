//! Fleet status and issue reset commands.

use anyhow::Result;
use std::path::Path;

use conveyor::checkpoint::{
    CheckpointState, FleetCheckpoint, FleetIssueStatus, IssueCheckpoint, PipelineStatus,
    issue_checkpoint_path, read_json_lenient,
};
use conveyor::config::FleetConfig;

fn styled_status(status: FleetIssueStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        FleetIssueStatus::Completed => console::style(text).green(),
        FleetIssueStatus::Failed => console::style(text).red(),
        FleetIssueStatus::Running => console::style(text).yellow(),
        FleetIssueStatus::NotStarted => console::style(text).dim(),
    }
}

pub async fn cmd_status(project_dir: &Path) -> Result<()> {
    let config = FleetConfig::load(project_dir)?;
    let state_dir = config.state_dir();
    let fleet = FleetCheckpoint::load(config.fleet_checkpoint_path()).snapshot().await;

    println!();
    println!("Conveyor Fleet Status");
    println!("=====================");
    println!();

    if fleet.issues.is_empty() {
        println!("No issues recorded yet.");
        println!();
        println!("Run 'conveyor run --issues <file>' to start.");
        println!();
        return Ok(());
    }

    println!(
        "Started: {}   Updated: {}",
        fleet.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        fleet.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "Completed: {}  Running: {}  Failed: {}  Not started: {}",
        fleet.count(FleetIssueStatus::Completed),
        fleet.count(FleetIssueStatus::Running),
        fleet.count(FleetIssueStatus::Failed),
        fleet.count(FleetIssueStatus::NotStarted)
    );
    println!();
    println!(
        "{:<8} {:<14} {:<10} {:<8} Title",
        "Issue", "Status", "Tokens", "Phase"
    );
    println!(
        "{:<8} {:<14} {:<10} {:<8} -----",
        "-----", "------", "------", "-----"
    );

    for (number, record) in &fleet.issues {
        let checkpoint: Option<CheckpointState> =
            read_json_lenient(&issue_checkpoint_path(&state_dir, *number));
        let phase = checkpoint
            .as_ref()
            .filter(|c| c.status != PipelineStatus::NotStarted)
            .map(|c| c.current_phase.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{:<7} {:<14} {:<10} {:<8} {}",
            number,
            styled_status(record.status),
            record.token_usage,
            phase,
            record.issue_title
        );

        if let Some(checkpoint) = checkpoint {
            for result in checkpoint.phases.iter().filter(|r| !r.success) {
                println!(
                    "         {} phase {} ({}): {}",
                    console::style("x").red(),
                    result.phase,
                    result.phase_name,
                    result.error.as_deref().unwrap_or("failed")
                );
            }
        }
    }
    println!();

    let resumable = FleetCheckpoint::load(config.fleet_checkpoint_path())
        .issues_to_resume()
        .await;
    if !resumable.is_empty() {
        println!(
            "{} issue(s) will resume on the next run: {:?}",
            resumable.len(),
            resumable
        );
        println!();
    }
    Ok(())
}

pub async fn cmd_reset(project_dir: &Path, issue: u64) -> Result<()> {
    let config = FleetConfig::load(project_dir)?;
    let state_dir = config.state_dir();

    let checkpoint_path = issue_checkpoint_path(&state_dir, issue);
    let had_checkpoint = checkpoint_path.exists();
    if had_checkpoint {
        IssueCheckpoint::load(&state_dir, issue, "").reset().await?;
    }
    let had_record = FleetCheckpoint::load(config.fleet_checkpoint_path())
        .remove_issue(issue)
        .await?;

    if had_checkpoint || had_record {
        println!("Reset issue #{}. It will start from phase 1 on the next run.", issue);
    } else {
        println!("Nothing to reset for issue #{}.", issue);
    }
    Ok(())
}
