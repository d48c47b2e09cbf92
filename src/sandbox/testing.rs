use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::report;
use crate::workspace::Workspace;

use super::{BoundedCommand, Capture, TestRunResult, run_bounded};

/// Marker carried by every timeout message
pub const TIMEOUT_MARKER: &str = "tester-timed-out";

/// Runs one test unit against the compiled workspace under a wall-clock limit
pub async fn run_test(
    config: &Config,
    workspace: &Workspace,
    unit: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> TestRunResult {
    let working_dir = workspace.src_dir();
    let class_path = working_dir.to_string_lossy().into_owned();
    let selector = test_selector(unit);
    let argv = generate_test_command(config, &class_path, &selector);

    let output = run_bounded(
        BoundedCommand {
            argv: &argv,
            cwd: &working_dir,
            limit: timeout,
            grace: config.kill_grace.as_duration(),
            capture: Capture::Separate,
        },
        cancel,
    )
    .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => return TestRunResult::InfrastructureError(e),
    };

    if output.timed_out {
        log::info!("Test unit {selector} timed out after {:.1}s", timeout.as_secs_f64());
        return TestRunResult::Timeout {
            stderr: output.stderr,
        };
    }

    // The runner always prints a report, even when every test fails, so a
    // silent run is a tester that never got to report (e.g. it exited itself)
    if output.stdout.trim().is_empty() {
        log::warn!(
            "Test runner produced no report for {selector} (exit code {:?})",
            output.code()
        );
        return TestRunResult::Timeout {
            stderr: output.stderr,
        };
    }

    if report::tests_passed(&output.stdout, output.code()) {
        log::info!("Test unit {selector} passed");
        TestRunResult::Success {
            report: output.stdout,
        }
    } else {
        log::info!("Test unit {selector} reported failures");
        TestRunResult::TestFailure {
            report: report::render_test_failure(&selector, &output.stdout, &output.stderr),
        }
    }
}

/// Turns a test unit path into a fully qualified selector: `pkg/FooTest.java` -> `pkg.FooTest`
pub fn test_selector(unit: &str) -> String {
    let stem = match unit.rfind('.') {
        Some(dot) if !unit[dot..].contains(['/', '\\']) => &unit[..dot],
        _ => unit,
    };
    stem.replace(['/', '\\'], ".")
}

fn generate_test_command(config: &Config, class_path: &str, selector: &str) -> Vec<String> {
    let mut mapping = HashMap::<&str, &str>::new();
    mapping.insert("%JUNIT%", &config.junit_path);
    mapping.insert("%CLASSPATH%", class_path);
    mapping.insert("%SELECTOR%", selector);
    config.test_runner.render(&mapping)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_strips_extension_and_qualifies() {
        assert_eq!(test_selector("pkg/FooTest.java"), "pkg.FooTest");
        assert_eq!(test_selector("a/b/c/SuiteAll.java"), "a.b.c.SuiteAll");
        assert_eq!(test_selector("FooTest"), "FooTest");
        assert_eq!(test_selector("v1.2/FooTest"), "v1.2.FooTest");
    }

    #[test]
    fn test_default_runner_command() {
        let config = Config::default();
        let argv = generate_test_command(&config, "/tmp/ws/src", "pkg.FooTest");

        assert_eq!(argv[0], "java");
        assert!(argv.contains(&"-cp=/tmp/ws/src".to_string()));
        assert!(argv.contains(&"pkg.FooTest".to_string()));
        assert!(argv.contains(&"--disable-ansi-colors".to_string()));
        assert!(argv.contains(&"--fail-if-no-tests".to_string()));
        assert!(argv.contains(&"junit-jupiter".to_string()));
    }
}
