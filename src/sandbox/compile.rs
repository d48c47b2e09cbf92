use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::workspace::Workspace;

use super::{BoundedCommand, BuildResult, Capture, SystemError, run_bounded};

const COMPILE_OUTPUT_FILE: &str = "compile_output.txt";

/// Compiles each file on its own, in order, from inside `<workspace>/src`
///
/// `strict` marks harness code (testers and suites): a compile error there is a system fault,
/// not the submitter's.
pub async fn compile(
    config: &Config,
    workspace: &Workspace,
    files: &[String],
    strict: bool,
    cancel: &CancellationToken,
) -> BuildResult {
    match compile_all(config, workspace, files, strict, cancel).await {
        Ok(result) => result,
        Err(e) => BuildResult::InfrastructureError(e),
    }
}

async fn compile_all(
    config: &Config,
    workspace: &Workspace,
    files: &[String],
    strict: bool,
    cancel: &CancellationToken,
) -> Result<BuildResult, SystemError> {
    let working_dir = workspace.src_dir();
    if !working_dir.is_dir() {
        return Err(SystemError::MissingDirectory {
            context: "compile",
            path: working_dir,
        });
    }

    // Checked up front so a missing harness file is never reported as a compile error
    for file in files {
        let path = working_dir.join(file);
        if !path.exists() {
            return Err(SystemError::MissingFile {
                context: "compile",
                path,
            });
        }
    }

    let output_path = workspace.root().join(COMPILE_OUTPUT_FILE);
    for file in files {
        let argv = generate_compile_command(config, file);
        let output = run_bounded(
            BoundedCommand {
                argv: &argv,
                cwd: &working_dir,
                limit: config.compile_timeout.as_duration(),
                grace: config.kill_grace.as_duration(),
                capture: Capture::Merged(output_path.clone()),
            },
            cancel,
        )
        .await?;

        if output.timed_out {
            return Err(SystemError::TimedOut {
                command: output.command,
                limit: config.compile_timeout.as_duration(),
            });
        }

        if output.success() {
            log::debug!("Compiled {file}");
            continue;
        }

        if strict {
            log::error!("Harness file {file} failed to compile");
            return Err(SystemError::CommandFailed {
                code: output.code(),
                command: output.command,
                output: output.stdout,
            });
        }

        log::info!("Submitted file {file} failed to compile");
        return Ok(BuildResult::CompileFailure {
            file: file.clone(),
            output: output.stdout,
        });
    }

    Ok(BuildResult::Success)
}

/// Generates the compile command by applying template substitutions
fn generate_compile_command(config: &Config, file: &str) -> Vec<String> {
    let mut mapping = HashMap::<&str, &str>::new();
    mapping.insert("%INPUT%", file);
    mapping.insert("%JUNIT%", &config.junit_path);
    mapping.insert("%CLASSPATH%", ".");
    config.compiler.render(&mapping)
}
