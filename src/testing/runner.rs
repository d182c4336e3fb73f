//! Test runner implementation
//!
//! Executes test scenarios against a real adapter, asserting on the
//! structured DAP responses rather than on rendered output.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use colored::Colorize;
use serde_json::Value;
use tokio::process::Command as TokioCommand;

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::harness::Harness;
use crate::inspect::Expected;
use crate::launch::{Expander, LaunchDocument};
use crate::supervisor::AdapterProcess;

use super::config::{LaunchSource, TestScenario, TestStep};

/// Result of a test run
#[derive(Debug)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub steps_run: usize,
    pub steps_total: usize,
    pub error: Option<String>,
}

/// Load a scenario from a YAML file
pub fn load_scenario(path: &Path) -> Result<TestScenario> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read test scenario '{}': {}",
            path.display(),
            e
        ))
    })?;

    serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse test scenario: {}", e)))
}

/// Run a test scenario from a YAML file
pub async fn run_scenario(path: &Path, config: &Config, verbose: bool) -> Result<TestResult> {
    let scenario = load_scenario(path)?;
    let steps_total = scenario.steps.len();

    println!(
        "\n{} {}",
        "Running Test:".blue().bold(),
        scenario.name.white().bold()
    );

    if let Some(desc) = &scenario.description {
        println!("  {}", desc.dimmed());
    }

    if let Some(setup_steps) = &scenario.setup {
        println!("\n{}", "Setup:".cyan());
        for step in setup_steps {
            if verbose {
                println!("  $ {}", step.shell.dimmed());
            }

            let status = TokioCommand::new("sh")
                .arg("-c")
                .arg(&step.shell)
                .stdin(Stdio::null())
                .stdout(if verbose { Stdio::inherit() } else { Stdio::null() })
                .stderr(if verbose { Stdio::inherit() } else { Stdio::null() })
                .status()
                .await
                .map_err(|e| Error::Config(format!("Setup command failed to execute: {}", e)))?;

            if !status.success() {
                return Ok(TestResult {
                    name: scenario.name.clone(),
                    passed: false,
                    steps_run: 0,
                    steps_total,
                    error: Some(format!(
                        "Setup command '{}' failed with exit code {:?}",
                        step.shell,
                        status.code()
                    )),
                });
            }
            println!("  {} {}", "✓".green(), step.shell.dimmed());
        }
    }

    // Launch documents given by path are relative to the scenario
    let scenario_dir = path.parent().unwrap_or(Path::new("."));
    let document = match &scenario.launch {
        LaunchSource::File(file) if file.is_relative() => LaunchDocument::load(&scenario_dir.join(file))?,
        LaunchSource::File(file) => LaunchDocument::load(file)?,
        LaunchSource::Inline(document) => document.clone(),
    };

    let mut config = config.clone();
    if let Some(adapter) = &scenario.adapter {
        config.adapter = adapter.clone();
    }

    let expander = Expander::new();
    let launch = document.resolve(&expander)?;

    println!("\n{}", "Starting debug session...".cyan());
    let process = AdapterProcess::from_config(&config.adapter, &expander)?;
    let mut harness = Harness::start(&config, process, &launch).await?;

    if verbose {
        println!(
            "  Adapter: {}",
            config.adapter.path.display().to_string().dimmed()
        );
    }
    println!("  {} Session started", "✓".green());

    println!("\n{}", "Steps:".cyan());

    let default_timeout = config.timeouts.request();
    for (i, step) in scenario.steps.iter().enumerate() {
        let step_num = i + 1;

        if let Err(e) = execute_step(&mut harness, step, step_num, default_timeout, verbose).await {
            println!("  {} Step {}: {}", "✗".red(), step_num, e);
            harness.shutdown().await;

            return Ok(TestResult {
                name: scenario.name.clone(),
                passed: false,
                steps_run: step_num,
                steps_total,
                error: Some(e.to_string()),
            });
        }
    }

    harness.shutdown().await;

    println!(
        "\n{} {}\n",
        "✓".green().bold(),
        "Test Passed".green().bold()
    );

    Ok(TestResult {
        name: scenario.name,
        passed: true,
        steps_run: steps_total,
        steps_total,
        error: None,
    })
}

/// Execute a single test step
async fn execute_step(
    harness: &mut Harness,
    step: &TestStep,
    step_num: usize,
    default_timeout: Duration,
    verbose: bool,
) -> Result<()> {
    match step {
        TestStep::AwaitStop {
            timeout_ms,
            reason,
            function,
            line,
        } => {
            let limit = timeout_ms.map(Duration::from_millis).unwrap_or(default_timeout);
            let stop = harness.await_stop(limit).await?;

            if let Some(expected_reason) = reason {
                if &stop.reason != expected_reason {
                    return Err(Error::TestAssertion(format!(
                        "Expected stop reason '{}', got '{}'",
                        expected_reason, stop.reason
                    )));
                }
            }

            if let Some(expected_function) = function {
                let actual = stop.frame.as_ref().map(|f| f.name.as_str()).unwrap_or("");
                if !actual.contains(expected_function.as_str()) {
                    return Err(Error::TestAssertion(format!(
                        "Expected function '{}', got '{}'",
                        expected_function, actual
                    )));
                }
            }

            if let Some(expected_line) = line {
                let actual = stop.frame.as_ref().map(|f| f.line).unwrap_or(0);
                if *expected_line != actual {
                    return Err(Error::TestAssertion(format!(
                        "Expected line {}, got {}",
                        expected_line, actual
                    )));
                }
            }

            println!(
                "  {} Step {}: await stop ({} at {})",
                "✓".green(),
                step_num,
                stop.reason.dimmed(),
                stop.location().dimmed()
            );
        }

        TestStep::CompareLocals { frame, expected } => {
            let expected_tree = Expected::from_json(expected)?;
            let locals = harness.locals(*frame).await?;

            if verbose {
                let snapshot = harness.variables().snapshot(locals, 4).await?;
                println!("    {}", snapshot.to_string().dimmed());
            }

            harness
                .variables()
                .compare_tree(locals, &expected_tree)
                .await?;

            let checked = match expected {
                Value::Object(map) => map.len(),
                _ => 0,
            };
            println!(
                "  {} Step {}: compare locals ({} top-level entries)",
                "✓".green(),
                step_num,
                checked
            );
        }

        TestStep::Evaluate {
            expression,
            frame,
            success,
            result,
        } => {
            let should_succeed = success.unwrap_or(true);
            match harness.evaluate(expression, *frame).await {
                Ok(value) => {
                    if !should_succeed {
                        return Err(Error::TestAssertion(format!(
                            "Expected evaluation of '{}' to fail, got '{}'",
                            expression, value["result"]
                        )));
                    }
                    if let Some(expected) = result {
                        let actual = value["result"].as_str().unwrap_or("");
                        if actual != expected {
                            return Err(Error::TestAssertion(format!(
                                "Expression '{}': expected '{}', got '{}'",
                                expression, expected, actual
                            )));
                        }
                    }
                    println!(
                        "  {} Step {}: evaluate {} = {}",
                        "✓".green(),
                        step_num,
                        expression.dimmed(),
                        value["result"].as_str().unwrap_or("").dimmed()
                    );
                }
                Err(Error::DapRequestFailed { message, .. }) if !should_succeed => {
                    println!(
                        "  {} Step {}: evaluate {} (expected failure: {})",
                        "✓".green(),
                        step_num,
                        expression.dimmed(),
                        message.dimmed()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        TestStep::Continue => {
            harness.resume().await?;
            println!("  {} Step {}: continue", "✓".green(), step_num);
        }

        TestStep::ExpectExit { code, timeout_ms } => {
            let limit = timeout_ms.map(Duration::from_millis).unwrap_or(default_timeout);
            let actual = harness.await_exit(limit).await?;

            if let Some(expected) = code {
                if *expected != actual {
                    return Err(Error::TestAssertion(format!(
                        "Expected exit code {}, got {}",
                        expected, actual
                    )));
                }
            }
            println!(
                "  {} Step {}: exited with code {}",
                "✓".green(),
                step_num,
                actual
            );
        }
    }

    Ok(())
}
