use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::sandbox::{SystemError, TIMEOUT_MARKER};

static SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\s*(\d+)\s+tests\s+(found|successful|failed)\s*\]").expect("valid summary pattern")
});

static FAILURE_ORDINAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\)").expect("valid ordinal pattern"));

const BANNER: &str = "=============================";
const SEPARATOR: &str = "----------------------------------------------------------------------";

/// Final classification of a grading run
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    ManifestMismatch,
    CompileFailure,
    InfrastructureError,
    TestFailure,
    Timeout,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Passed,
    Failed,
    TimedOut,
}

/// Result of one test unit as shown to the submitter
#[derive(Serialize, Debug, Clone)]
pub struct UnitOutcome {
    pub unit: String,
    pub selector: String,
    pub status: UnitStatus,
    pub message: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct Report {
    pub user: String,
    pub timestamp: String,
    /// Warnings that do not change the verdict (file mismatch, late submission, bad group file)
    pub notices: Vec<String>,
    pub verdict: Verdict,
    /// Text explaining the verdict; empty on success
    pub message: String,
    pub units: Vec<UnitOutcome>,
    /// Staged workspace left on disk for inspection
    pub workspace: Option<PathBuf>,
}

impl Report {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            timestamp: crate::create_timestamp(),
            notices: Vec::new(),
            verdict: Verdict::Success,
            message: String::new(),
            units: Vec::new(),
            workspace: None,
        }
    }

    /// Ends the run with `verdict`
    pub fn halt(mut self, verdict: Verdict, message: String) -> Self {
        self.verdict = verdict;
        self.message = message;
        self
    }

    /// Records a unit; the first unit that does not pass decides the verdict
    pub fn push_unit(&mut self, outcome: UnitOutcome) {
        if self.verdict == Verdict::Success {
            match outcome.status {
                UnitStatus::Passed => {}
                UnitStatus::Failed => self.verdict = Verdict::TestFailure,
                UnitStatus::TimedOut => self.verdict = Verdict::Timeout,
            }
        }
        if outcome.status != UnitStatus::Passed {
            self.message.push_str(&outcome.message);
        }
        self.units.push(outcome);
    }

    pub fn is_system_error(&self) -> bool {
        self.verdict == Verdict::InfrastructureError
    }

    /// Text printed for the submitter
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{BANNER}\nProcessing user: {}\n{BANNER}", self.user);

        for notice in &self.notices {
            let _ = writeln!(out, "\n{}", notice.trim_end());
        }
        out.push('\n');

        match self.verdict {
            Verdict::ManifestMismatch | Verdict::InfrastructureError => {
                let _ = writeln!(out, "{}", self.message.trim_end());
            }
            Verdict::CompileFailure => {
                let _ = writeln!(out, "------ Error compiling ----\n{}", self.message);
            }
            Verdict::Success | Verdict::TestFailure | Verdict::Timeout => {
                out.push_str("Running tests..\n");
                for unit in &self.units {
                    let _ = writeln!(out, "=> test: {}", unit.unit);
                }
                if self.verdict == Verdict::Success {
                    out.push_str("Unit tests successfully run on your submission.\n");
                } else {
                    out.push_str("Unit tests could not run on your submission.\n");
                    out.push_str(&self.message);
                }
                out.push_str("\nYour submission has been successfully processed.\n");
            }
        }

        if let Some(path) = &self.workspace {
            let _ = writeln!(out, "\nWorkspace kept at {}", path.display());
        }
        out
    }
}

/// Counts printed at the end of a test runner report
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TestSummary {
    pub found: Option<u32>,
    pub successful: Option<u32>,
    pub failed: Option<u32>,
}

pub fn parse_summary(output: &str) -> TestSummary {
    let mut summary = TestSummary::default();
    for line in output.lines() {
        let Some(caps) = SUMMARY_LINE.captures(line.trim()) else {
            continue;
        };
        let count = caps[1].parse().ok();
        match &caps[2] {
            "found" => summary.found = count,
            "successful" => summary.successful = count,
            "failed" => summary.failed = count,
            _ => {}
        }
    }
    summary
}

/// A unit passes when the runner exited cleanly and reported no failed tests
pub fn tests_passed(output: &str, exit_code: Option<i32>) -> bool {
    let summary = parse_summary(output);
    summary.failed.unwrap_or(0) == 0 && exit_code == Some(0)
}

/// Drops stack frame lines (`at ...`), keeping everything else
fn without_frames(output: &str) -> Vec<&str> {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with("at "))
        .collect()
}

/// Individual failure blocks, each starting at an ordinal line such as `1) testFoo`
fn failure_blocks(lines: &[&str]) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in lines {
        let trimmed = line.trim();
        if FAILURE_ORDINAL.is_match(trimmed) {
            blocks.extend(current.take());
            current = Some(format!("{line}\n"));
        } else if trimmed.is_empty() || SUMMARY_LINE.is_match(trimmed) {
            blocks.extend(current.take());
        } else if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
        }
    }
    blocks.extend(current);
    blocks
}

/// Message for a unit whose report contains failures
///
/// Keeps the summary counts and the failure blocks. A report without numbered blocks is kept
/// whole, minus stack frames and the summary lines already written.
pub fn render_test_failure(selector: &str, stdout: &str, stderr: &str) -> String {
    let lines = without_frames(stdout);
    let mut out = format!(
        "\n\nYOUR SUBMISSION FAILED SOME UNIT TESTS for {selector}\nHere is the test output:\n\n"
    );

    for line in lines.iter().filter(|l| SUMMARY_LINE.is_match(l.trim())) {
        let _ = writeln!(out, "{}", line.trim());
    }

    let blocks = failure_blocks(&lines);
    if blocks.is_empty() {
        // Summary lines were written above
        for line in lines.iter().filter(|line| !SUMMARY_LINE.is_match(line.trim())) {
            let _ = writeln!(out, "{line}");
        }
    } else {
        for block in &blocks {
            let _ = write!(out, "\n{block}");
        }
    }

    let stderr = without_frames(stderr).join("\n");
    if !stderr.trim().is_empty() {
        let _ = writeln!(out, "{SEPARATOR}\n{}", stderr.trim_end());
    }
    out
}

pub fn render_timeout(selector: &str, timeout: Duration, stderr: &str) -> String {
    let mut out = format!(
        "\n\nCould not run {selector} within {} seconds: {TIMEOUT_MARKER}!\n",
        timeout.as_secs_f64()
    );
    let stderr = without_frames(stderr).join("\n");
    if !stderr.trim().is_empty() {
        let _ = writeln!(out, "{SEPARATOR}\n{}", stderr.trim_end());
    }
    out
}

pub fn render_compile_failure(file: &str, output: &str) -> String {
    format!("YOUR SUBMISSION FAILED TO COMPILE for {file}\nHere is the compiler output:\n\n{output}")
}

pub fn render_manifest_mismatch(expected: &[String], submitted: &[String]) -> String {
    format!(
        "ERROR We expected the files:\n\n{}\n\nbut you submitted the files:\n\n{}",
        expected.join("\n"),
        submitted.join("\n")
    )
}

/// Operator-facing message for a fault that is not the submitter's
pub fn render_system_error(err: &SystemError, contact: Option<&str>) -> String {
    let recipient = match contact {
        Some(contact) => format!("Please email the following error message to {contact}:"),
        None => "Please forward the following error message to the course staff:".to_string(),
    };
    format!("There was a system error with your submission.\n{recipient}\n\n{err}")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const FAILING_REPORT: &str = "\
Thanks for using JUnit!
'-- JUnit Jupiter [OK]
  '-- FooTest [OK]
    +-- addsNumbers() [OK]
    '-- dividesNumbers() [X] expected: <2> but was: <3>

Failures (1):
1) dividesNumbers()
   org.opentest4j.AssertionFailedError: expected: <2> but was: <3>
       at org.junit.jupiter.api.AssertionUtils.fail(AssertionUtils.java:55)
       at pkg.FooTest.dividesNumbers(FooTest.java:20)

[         2 tests found           ]
[         1 tests successful      ]
[         1 tests failed          ]
";

    #[test]
    fn test_parse_summary_counts() {
        assert_eq!(
            parse_summary(FAILING_REPORT),
            TestSummary {
                found: Some(2),
                successful: Some(1),
                failed: Some(1),
            }
        );
        assert_eq!(parse_summary("no summary here"), TestSummary::default());
    }

    #[test]
    fn test_tests_passed_needs_clean_exit_and_no_failures() {
        let clean = "[  3 tests found  ]\n[  3 tests successful  ]\n[  0 tests failed  ]\n";
        assert!(tests_passed(clean, Some(0)));
        assert!(!tests_passed(clean, Some(1)));
        assert!(!tests_passed(clean, None));
        assert!(!tests_passed(FAILING_REPORT, Some(0)));
    }

    #[test]
    fn test_failure_render_keeps_summary_and_blocks_without_frames() {
        let text = render_test_failure("pkg.FooTest", FAILING_REPORT, "");

        assert!(text.contains("YOUR SUBMISSION FAILED SOME UNIT TESTS for pkg.FooTest"));
        assert!(text.contains("[         1 tests failed          ]"));
        assert!(text.contains(
            "\n1) dividesNumbers()\n   org.opentest4j.AssertionFailedError: expected: <2> but was: <3>\n"
        ));
        assert!(!text.contains("AssertionUtils.java"));
        assert!(!text.contains("Thanks for using JUnit"));
    }

    #[test]
    fn test_failure_render_without_ordinals_keeps_whole_report() {
        let report = "'-- FooTest [X] boom\n   at pkg.FooTest.run(FooTest.java:3)\n[ 1 tests failed ]\n";
        let text = render_test_failure("FooTest", report, "warning: slow\n");

        assert!(text.contains("'-- FooTest [X] boom\n"));
        assert!(!text.contains("FooTest.java:3"));
        assert_eq!(text.matches("[ 1 tests failed ]").count(), 1);
        assert!(text.ends_with(&format!("{SEPARATOR}\nwarning: slow\n")));
    }

    #[test]
    fn test_failure_blocks_split_on_ordinals() {
        let lines = ["1) first", "  detail", "2) second", "", "not part of a block"];
        assert_eq!(
            failure_blocks(&lines),
            vec!["1) first\n  detail\n".to_string(), "2) second\n".to_string()]
        );
    }

    #[test]
    fn test_timeout_message_carries_marker() {
        let text = render_timeout("pkg.FooTest", Duration::from_secs(10), "");
        assert!(text.contains("Could not run pkg.FooTest within 10 seconds: tester-timed-out!"));
    }

    #[test]
    fn test_system_error_message_names_command_and_code() {
        let err = SystemError::CommandFailed {
            command: "javac pkg/FooTest.java".to_string(),
            output: "FooTest.java:1: error\n".to_string(),
            code: Some(1),
        };
        assert_eq!(
            render_system_error(&err, Some("staff@example.edu")),
            "There was a system error with your submission.\n\
             Please email the following error message to staff@example.edu:\n\n\
             FooTest.java:1: error\ncaused by: javac pkg/FooTest.java\nreturn code: 1"
        );
    }

    #[test]
    fn test_first_failing_unit_decides_verdict() {
        let unit = |status, message: &str| UnitOutcome {
            unit: "u".to_string(),
            selector: "u".to_string(),
            status,
            message: message.to_string(),
        };

        let mut report = Report::new("alice");
        report.push_unit(unit(UnitStatus::Passed, ""));
        report.push_unit(unit(UnitStatus::TimedOut, "slow;"));
        report.push_unit(unit(UnitStatus::Failed, "wrong;"));

        assert_eq!(report.verdict, Verdict::Timeout);
        assert_eq!(report.message, "slow;wrong;");
        assert_eq!(report.units.len(), 3);
    }

    #[test]
    fn test_render_success() {
        let mut report = Report::new("alice");
        report.push_unit(UnitOutcome {
            unit: "pkg/FooTest.java".to_string(),
            selector: "pkg.FooTest".to_string(),
            status: UnitStatus::Passed,
            message: String::new(),
        });

        assert_eq!(
            report.render(),
            "=============================\n\
             Processing user: alice\n\
             =============================\n\
             \n\
             Running tests..\n\
             => test: pkg/FooTest.java\n\
             Unit tests successfully run on your submission.\n\
             \n\
             Your submission has been successfully processed.\n"
        );
    }
}
