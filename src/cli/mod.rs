//! CLI command handling
//!
//! Dispatches CLI commands and formats their output.

use std::time::Duration;

use colored::Colorize;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::harness::Harness;
use crate::launch::{BreakpointLocation, Expander, LaunchDocument, RequestKind};
use crate::supervisor::AdapterProcess;
use crate::testing;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Expand { launch } => {
            let document = LaunchDocument::load(&launch)?;
            let resolved = document.resolve(&Expander::new())?;

            let mut output = resolved.arguments;
            if !resolved.breakpoints.is_empty() {
                output["breakpoints"] = resolved
                    .breakpoints
                    .iter()
                    .map(|bp| match bp {
                        BreakpointLocation::Line { file, line } => {
                            format!("{}:{}", file.display(), line)
                        }
                        BreakpointLocation::Function { name } => name.clone(),
                    })
                    .collect();
            }
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }

        Commands::Run {
            launch,
            attach,
            breakpoints,
            depth,
        } => {
            let expander = Expander::new();
            let mut resolved = LaunchDocument::load(&launch)?.resolve(&expander)?;
            if attach {
                resolved.request = RequestKind::Attach;
                resolved.arguments["request"] = RequestKind::Attach.command().into();
            }
            for location in &breakpoints {
                resolved.breakpoints.push(BreakpointLocation::parse(location)?);
            }

            let process = AdapterProcess::from_config(&config.adapter, &expander)?;
            let mut harness = Harness::start(&config, process, &resolved).await?;
            let result = run_to_exit(&mut harness, config.timeouts.request(), depth).await;
            let exit = harness.shutdown().await;
            tracing::debug!(%exit, "Adapter stopped");
            result
        }

        Commands::Test { paths, verbose } => {
            let mut failed = Vec::new();
            for path in &paths {
                let result = testing::run_scenario(path, &config, verbose).await?;
                if !result.passed {
                    println!(
                        "{} {} ({}/{} steps): {}",
                        "✗".red().bold(),
                        result.name.red(),
                        result.steps_run,
                        result.steps_total,
                        result.error.as_deref().unwrap_or("failed")
                    );
                    failed.push(result.name);
                }
            }

            if failed.is_empty() {
                Ok(())
            } else {
                Err(Error::TestAssertion(format!(
                    "{} of {} scenario(s) failed: {}",
                    failed.len(),
                    paths.len(),
                    failed.join(", ")
                )))
            }
        }
    }
}

/// Print every stop with its locals, resuming until the debuggee exits
async fn run_to_exit(harness: &mut Harness, limit: Duration, depth: usize) -> Result<()> {
    loop {
        let stop = match harness.await_stop(limit).await {
            Ok(stop) => stop.clone(),
            // Exited without stopping again
            Err(Error::SessionTerminated(_)) => break,
            Err(e) => return Err(e),
        };

        println!(
            "{} {} at {}",
            "Stopped:".yellow().bold(),
            stop.reason,
            stop.location()
        );

        let frames = harness.session().stack_trace(stop.thread_id, Some(20)).await?;
        for (i, frame) in frames.iter().enumerate() {
            println!("  #{} {} (line {})", i, frame.name, frame.line);
        }

        let locals = harness.locals(0).await?;
        let snapshot = harness.variables().snapshot(locals, depth).await?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);

        harness.resume().await?;
    }

    match harness.await_exit(limit).await {
        Ok(code) => {
            println!("{} exit code {}", "Exited:".green().bold(), code);
            Ok(())
        }
        Err(Error::SessionTerminated(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
