use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ManifestPolicy};
use crate::manifest::{Manifest, match_manifest};
use crate::report::{self, Report, UnitOutcome, UnitStatus, Verdict};
use crate::sandbox::{BuildResult, SystemError, TestRunResult, compile, run_test, test_selector};
use crate::submission::{Submission, submission_allowed, validate_group};
use crate::workspace::Workspace;

/// The four manifests of an assignment
#[derive(Debug, Clone)]
pub struct Manifests {
    pub sources: Manifest,
    pub other: Manifest,
    pub testers: Manifest,
    pub suites: Manifest,
}

impl Manifests {
    pub fn load(config: &Config) -> Result<Self, SystemError> {
        let files = &config.manifests;
        Ok(Self {
            sources: Manifest::load(&config.resolve(&files.sources))?,
            other: Manifest::load_optional(&config.resolve(&files.other))?,
            testers: Manifest::load(&config.resolve(&files.testers))?,
            suites: Manifest::load_optional(&config.resolve(&files.suites))?,
        })
    }

    /// Units to run: the suites when there are any, otherwise each tester
    pub fn test_units(&self) -> &Manifest {
        if self.suites.is_empty() {
            &self.testers
        } else {
            &self.suites
        }
    }
}

/// Grades one submission at a time against a fixed configuration
pub struct Grader<'a> {
    config: &'a Config,
}

impl<'a> Grader<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Runs the whole pipeline: manifest check, staging, compilation, then every test unit
    pub async fn grade(&self, user: &str, files: &[String], cancel: &CancellationToken) -> Report {
        log::info!("Grading submission of {user} ({} files)", files.len());
        let mut report = Report::new(user);

        let manifests = match Manifests::load(self.config) {
            Ok(manifests) => manifests,
            Err(e) => return self.system_fault(report, e),
        };
        let submission = match Submission::partition(self.config, user, files) {
            Ok(submission) => submission,
            Err(e) => return self.system_fault(report, e),
        };

        self.check_group(&submission, &mut report);
        self.check_deadline(user, &mut report);

        if let Some(message) = manifest_mismatch(&manifests, &submission) {
            match self.config.manifest_policy {
                ManifestPolicy::Warn => {
                    log::warn!("Submission of {user} does not match the manifests");
                    report.notices.push(message);
                }
                ManifestPolicy::Reject => {
                    log::warn!("Submission of {user} rejected: files do not match the manifests");
                    return report.halt(
                        Verdict::ManifestMismatch,
                        format!("{message}\n\nPlease try submitting again with the expected files"),
                    );
                }
            }
        }

        let workspace = match Workspace::stage(
            self.config,
            user,
            &submission.sources,
            manifests.sources.entries(),
        ) {
            Ok(workspace) => workspace,
            Err(e) => return self.system_fault(report, e),
        };
        log::info!("Workspace staged at {}", workspace.root().display());

        match compile(self.config, &workspace, manifests.sources.entries(), false, cancel).await {
            BuildResult::Success => {}
            BuildResult::CompileFailure { file, output } => {
                return report.halt(
                    Verdict::CompileFailure,
                    report::render_compile_failure(&file, &output),
                );
            }
            BuildResult::InfrastructureError(e) => return self.system_fault(report, e),
        }

        for harness in [&manifests.testers, &manifests.suites] {
            if let Err(e) = self.compile_harness(&workspace, harness, cancel).await {
                return self.system_fault(report, e);
            }
        }

        let timeout = self.config.test_timeout.as_duration();
        for unit in manifests.test_units().entries() {
            let selector = test_selector(unit);
            let result = run_test(self.config, &workspace, unit, timeout, cancel).await;
            let (status, message) = match result {
                TestRunResult::Success { .. } => (UnitStatus::Passed, String::new()),
                TestRunResult::TestFailure { report: text } => (UnitStatus::Failed, text),
                TestRunResult::Timeout { stderr } => (
                    UnitStatus::TimedOut,
                    report::render_timeout(&selector, timeout, &stderr),
                ),
                TestRunResult::InfrastructureError(e) => return self.system_fault(report, e),
            };
            report.push_unit(UnitOutcome {
                unit: unit.clone(),
                selector,
                status,
                message,
            });
        }

        log::info!("Submission of {user} graded: {:?}", report.verdict);
        if report.verdict == Verdict::Success && self.config.keep_workspace {
            report.workspace = Some(workspace.keep());
        }
        report
    }

    /// Harness code must always compile; any failure is ours
    async fn compile_harness(
        &self,
        workspace: &Workspace,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<(), SystemError> {
        if manifest.is_empty() {
            return Ok(());
        }

        match compile(self.config, workspace, manifest.entries(), true, cancel).await {
            BuildResult::Success => Ok(()),
            BuildResult::InfrastructureError(e) => Err(e),
            BuildResult::CompileFailure { file, output } => Err(SystemError::CommandFailed {
                command: format!("compile {file}"),
                output,
                code: None,
            }),
        }
    }

    fn check_group(&self, submission: &Submission, report: &mut Report) {
        let Some(file) = &submission.group_file else {
            return;
        };

        let errors = validate_group(&submission.group);
        if errors.is_empty() {
            report.notices.push(format!(
                "This is a group submission with group members:\n\n{}\n",
                submission.group.join("\n")
            ));
        } else {
            report.notices.push(format!(
                "There are errors in your {file} file:\n\n{errors}\n\
                 {file} should consist of exactly one user name per line and nothing else.\n"
            ));
        }
    }

    fn check_deadline(&self, user: &str, report: &mut Report) {
        let Some(deadline) = &self.config.deadline else {
            return;
        };

        let now = Local::now().fixed_offset();
        if !submission_allowed(deadline, user, now) {
            log::info!("Submission of {user} is past the deadline");
            report
                .notices
                .push(">>> Notice: Deadline is passed for submission <<<".to_string());
        }
    }

    fn system_fault(&self, report: Report, err: SystemError) -> Report {
        log::error!("System error while grading {}: {err}", report.user);
        let message = report::render_system_error(&err, self.config.operator_contact.as_deref());
        report.halt(Verdict::InfrastructureError, message)
    }
}

/// Mismatch message when either the sources or the other files differ from their manifest
fn manifest_mismatch(manifests: &Manifests, submission: &Submission) -> Option<String> {
    let (sources_match, expected_sources) =
        match_manifest(manifests.sources.entries(), &submission.source_names());
    let (other_match, expected_other) =
        match_manifest(manifests.other.entries(), &submission.other_names());

    if sources_match && other_match {
        return None;
    }

    let expected = [expected_sources, expected_other].concat();
    let submitted = [submission.sources.as_slice(), submission.other.as_slice()].concat();
    Some(report::render_manifest_mismatch(&expected, &submitted))
}
