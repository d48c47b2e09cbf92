use std::fs;
use std::path::Path;

use crate::sandbox::SystemError;

/// Expected relative paths of one submission component, sorted and free of duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<String>,
}

impl Manifest {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries: Vec<String> = lines
            .into_iter()
            .map(|line| line.as_ref().trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        entries.sort();
        entries.dedup();
        Self { entries }
    }

    /// Reads a line-delimited manifest that must exist
    pub fn load(path: &Path) -> Result<Self, SystemError> {
        let content = fs::read_to_string(path).map_err(|source| SystemError::Io {
            context: "load_manifest",
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_lines(content.lines()))
    }

    /// Reads a manifest that may be absent, in which case it is empty
    pub fn load_optional(path: &Path) -> Result<Self, SystemError> {
        if path.is_file() {
            Self::load(path)
        } else {
            log::debug!("Optional manifest {} not found", path.display());
            Ok(Self::default())
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compares the submitted file names against a manifest, ignoring the manifest's directories
///
/// `got` must already be sorted. Returns whether the sorted basenames of `expected` equal `got`
/// exactly, together with those basenames.
pub fn match_manifest<S: AsRef<str>>(expected: &[S], got: &[String]) -> (bool, Vec<String>) {
    let mut names: Vec<String> = expected
        .iter()
        .map(|path| basename(path.as_ref()).to_string())
        .collect();
    names.sort();
    (names == got, names)
}

/// Last path component, accepting both separators
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
