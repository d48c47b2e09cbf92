use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, FixedOffset};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Name of the configuration file looked up inside the assignment directory
pub const CONFIG_FILE_NAME: &str = "grader.json";

#[derive(Parser, Debug)]
#[command(name = "grader", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// User name of the submitter
    pub user: String,

    /// Submitted files, relative to the submitter's folder
    #[arg(required_unless_present = "decommission")]
    pub files: Vec<String>,

    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// Assignment directory holding the manifests, the harness and the submissions
    #[arg(long = "assignment-dir", short = 'd')]
    pub assignment_dir: Option<PathBuf>,

    /// Print the report as JSON instead of text
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Keep the staged workspace after a successful run
    #[arg(long = "keep-workspace", default_value_t = false)]
    pub keep_workspace: bool,

    /// Delete the submitter's folder instead of grading it
    #[arg(long, default_value_t = false, requires = "confirm")]
    pub decommission: bool,

    /// Must repeat the user name for --decommission to proceed
    #[arg(long)]
    pub confirm: Option<String>,

    /// Message shown to the submitter when the folder is removed
    #[arg(long, requires = "decommission")]
    pub reason: Option<String>,
}

impl CliArgs {
    /// Resolve the configuration file and apply command line overrides
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let assignment_dir = self
            .assignment_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        let mut config = match self.locate_config_file(&assignment_dir) {
            Some(path) => {
                log::info!("Loading configuration from {}", path.display());
                Config::from_file(&path)?
            }
            None => {
                log::info!("No configuration file found, using defaults");
                Config::default()
            }
        };

        if let Some(dir) = &self.assignment_dir {
            config.assignment_dir = dir.clone();
        }
        config.keep_workspace |= self.keep_workspace;

        Ok(config)
    }

    fn locate_config_file(&self, assignment_dir: &Path) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }

        let local = assignment_dir.join(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }

        directories::ProjectDirs::from("", "", "grader")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .filter(|path| path.is_file())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub assignment_dir: PathBuf,
    /// Harness template copied into every workspace
    pub harness_dir: PathBuf,
    /// Folder holding one sub-folder per submitter
    pub submissions_dir: PathBuf,
    pub manifests: ManifestFiles,
    pub junit_path: String,
    pub source_extension: String,
    pub group_file: String,
    pub compiler: CommandTemplate,
    pub test_runner: CommandTemplate,
    pub compile_timeout: Seconds,
    pub test_timeout: Seconds,
    pub kill_grace: Seconds,
    pub manifest_policy: ManifestPolicy,
    pub keep_workspace: bool,
    /// Parent directory for workspaces, the system temp dir when unset
    pub workspace_root: Option<PathBuf>,
    pub deadline: Option<DeadlineConfig>,
    pub operator_contact: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assignment_dir: PathBuf::from("."),
            harness_dir: PathBuf::from("_test"),
            submissions_dir: PathBuf::from("s"),
            manifests: ManifestFiles::default(),
            junit_path: "junit-platform-console-standalone.jar".to_string(),
            source_extension: "java".to_string(),
            group_file: "group.txt".to_string(),
            compiler: CommandTemplate::default_compiler(),
            test_runner: CommandTemplate::default_test_runner(),
            compile_timeout: Seconds(60.0),
            test_timeout: Seconds(10.0),
            kill_grace: Seconds(0.5),
            manifest_policy: ManifestPolicy::Warn,
            keep_workspace: false,
            workspace_root: None,
            deadline: None,
            operator_contact: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open configuration {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse configuration {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration {}", path.display()))?;
        Ok(config)
    }

    /// Rejects time limits that cannot be turned into a wall-clock duration
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("compile_timeout", self.compile_timeout),
            ("test_timeout", self.test_timeout),
            ("kill_grace", self.kill_grace),
        ] {
            value
                .try_duration()
                .with_context(|| format!("{name} must be a finite, non-negative number of seconds"))?;
        }
        Ok(())
    }

    /// Relative paths in the configuration are anchored at the assignment directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.assignment_dir.join(path)
        }
    }

    pub fn harness_path(&self) -> PathBuf {
        self.resolve(&self.harness_dir)
    }

    pub fn submission_folder(&self, user: &str) -> PathBuf {
        self.resolve(&self.submissions_dir).join(user)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ManifestFiles {
    pub sources: PathBuf,
    pub other: PathBuf,
    pub testers: PathBuf,
    pub suites: PathBuf,
}

impl Default for ManifestFiles {
    fn default() -> Self {
        Self {
            sources: PathBuf::from("java.txt"),
            other: PathBuf::from("other.txt"),
            testers: PathBuf::from("tester.txt"),
            suites: PathBuf::from("suite.txt"),
        }
    }
}

/// External command as a list of arguments with `%PLACEHOLDER%` substitutions
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate(pub Vec<String>);

impl CommandTemplate {
    fn default_compiler() -> Self {
        Self(
            ["javac", "-encoding", "ISO-8859-1", "-cp", ".:%JUNIT%", "%INPUT%"]
                .map(String::from)
                .to_vec(),
        )
    }

    fn default_test_runner() -> Self {
        Self(
            [
                "java",
                "-jar",
                "%JUNIT%",
                "-cp=%CLASSPATH%",
                "-c",
                "%SELECTOR%",
                "--disable-banner",
                "--disable-ansi-colors",
                "--details=tree",
                "--details-theme=ascii",
                "--fail-if-no-tests",
                "--include-engine",
                "junit-jupiter",
                "--exclude-engine",
                "junit-vintage",
            ]
            .map(String::from)
            .to_vec(),
        )
    }

    /// Applies template substitutions to every argument
    pub fn render(&self, mapping: &HashMap<&str, &str>) -> Vec<String> {
        self.0
            .iter()
            .map(|s| {
                let mut t = s.clone();
                for (k, v) in mapping.iter() {
                    t = t.replace(k, v);
                }
                t
            })
            .collect()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Seconds(pub f64);

impl Seconds {
    pub fn try_duration(self) -> Result<Duration, std::time::TryFromFloatSecsError> {
        Duration::try_from_secs_f64(self.0)
    }

    /// Saturating conversion: negative and NaN become zero, overly large values become `Duration::MAX`
    pub fn as_duration(self) -> Duration {
        Duration::try_from_secs_f64(self.0.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// What to do when the submitted file names differ from the manifests
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManifestPolicy {
    /// Report the mismatch and grade anyway
    Warn,
    /// Report the mismatch and stop before staging
    Reject,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeadlineConfig {
    pub due: DateTime<FixedOffset>,
    #[serde(default = "default_grace_hours")]
    pub grace_hours: i64,
    #[serde(default = "default_extension_days")]
    pub extension_days: i64,
    #[serde(default)]
    pub exception_users: Vec<String>,
}

fn default_grace_hours() -> i64 {
    4
}

fn default_extension_days() -> i64 {
    2
}
