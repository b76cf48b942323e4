//! Task plan validation: `conveyor plan <file>`.

use anyhow::{Context, Result};
use std::path::Path;

use conveyor::plan::TaskPlan;

pub fn cmd_plan(file: &Path) -> Result<()> {
    let plan = TaskPlan::load(file)?;
    let waves = plan
        .waves()
        .with_context(|| format!("Invalid task plan {}", file.display()))?;

    println!();
    println!(
        "{} {} task(s) in {} wave(s)",
        console::style("Plan OK:").green().bold(),
        plan.tasks.len(),
        waves.len()
    );
    println!();
    for (i, wave) in waves.iter().enumerate() {
        println!("Wave {}: {}", i + 1, wave.join(", "));
    }
    println!();
    Ok(())
}
