use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, bail};
use chrono::{DateTime, FixedOffset, TimeDelta};
use regex::Regex;

use crate::config::{Config, DeadlineConfig};
use crate::manifest::basename;
use crate::sandbox::SystemError;

static USER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]*$").expect("valid user name pattern"));

/// The files handed in for one grading run, split by role
///
/// Every submitted file lands in exactly one of `sources`, `group_file` or `other`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Files to compile, sorted
    pub sources: Vec<String>,
    /// The collaborator list file, if one was submitted
    pub group_file: Option<String>,
    /// Members read from the collaborator list
    pub group: Vec<String>,
    /// Everything else, sorted
    pub other: Vec<String>,
}

impl Submission {
    pub fn partition(config: &Config, user: &str, files: &[String]) -> Result<Self, SystemError> {
        let mut submission = Submission::default();

        for file in files {
            let is_source = Path::new(file)
                .extension()
                .is_some_and(|ext| ext == config.source_extension.as_str());

            if is_source {
                submission.sources.push(file.clone());
            } else if basename(file) == config.group_file {
                let path = submitted_file_path(config, user, file);
                let content = fs::read_to_string(&path).map_err(|source| SystemError::Io {
                    context: "read_group",
                    path,
                    source,
                })?;
                submission.group = content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from)
                    .collect();
                submission.group_file = Some(file.clone());
            } else {
                submission.other.push(file.clone());
            }
        }

        submission.sources.sort();
        submission.other.sort();
        Ok(submission)
    }

    /// Sorted file names of the sources, as compared against the source manifest
    pub fn source_names(&self) -> Vec<String> {
        sorted_names(&self.sources)
    }

    pub fn other_names(&self) -> Vec<String> {
        sorted_names(&self.other)
    }
}

fn sorted_names(files: &[String]) -> Vec<String> {
    let mut names: Vec<String> = files.iter().map(|f| basename(f).to_string()).collect();
    names.sort();
    names
}

/// Where a submitted file lives: relative names are inside the submitter's folder
pub fn submitted_file_path(config: &Config, user: &str, name: &str) -> PathBuf {
    let path = Path::new(name);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config.submission_folder(user).join(path)
    }
}

/// One line per group member that cannot be a user name; empty when the group is fine
pub fn validate_group(group: &[String]) -> String {
    group
        .iter()
        .filter(|member| !USER_NAME.is_match(member))
        .map(|member| format!("{member} is not a valid user name\n"))
        .collect()
}

/// Whether a submission made at `now` is still accepted
///
/// Late by more than the grace period is refused, except for listed users within the
/// extension window.
pub fn submission_allowed(deadline: &DeadlineConfig, user: &str, now: DateTime<FixedOffset>) -> bool {
    if now <= deadline.due + TimeDelta::hours(deadline.grace_hours) {
        return true;
    }
    deadline.exception_users.iter().any(|u| u == user)
        && now <= deadline.due + TimeDelta::days(deadline.extension_days)
}

/// Deletes the submitter's folder and everything in it
///
/// This destroys the only copy of the submission. `confirmation` must repeat the user name.
pub fn decommission(config: &Config, user: &str, confirmation: Option<&str>) -> anyhow::Result<PathBuf> {
    if confirmation != Some(user) {
        bail!("Refusing to remove the submission of {user}: confirmation does not match");
    }

    let mut components = Path::new(user).components();
    if !matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) {
        bail!("Refusing to remove the submission of {user:?}: not a plain user name");
    }

    let folder = config.submission_folder(user);
    if !folder.is_dir() {
        bail!("No submission folder at {}", folder.display());
    }

    fs::remove_dir_all(&folder)
        .with_context(|| format!("Failed to remove {}", folder.display()))?;
    log::warn!("Removed submission folder {}", folder.display());

    Ok(folder)
}
