use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use walkdir::WalkDir;

use crate::config::Config;
use crate::sandbox::SystemError;
use crate::submission::submitted_file_path;

const WORKSPACE_PREFIX: &str = "grader-";

/// Private build tree for one grading run
///
/// The directory is removed when the value is dropped, unless [`Workspace::keep`] is called.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Creates a fresh private directory holding a copy of the harness template
    pub fn from_harness(harness: &Path, parent: Option<&Path>) -> Result<Self, SystemError> {
        if !harness.is_dir() {
            return Err(SystemError::MissingDirectory {
                context: "stage",
                path: harness.to_path_buf(),
            });
        }

        // tempfile creates the directory with mode 0700
        let parent = parent.map_or_else(std::env::temp_dir, Path::to_path_buf);
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&parent)
            .map_err(|source| SystemError::Io {
                context: "stage",
                path: parent,
                source,
            })?;

        copy_tree(harness, dir.path())?;
        log::debug!("Harness copied into {}", dir.path().display());

        Ok(Self { dir })
    }

    /// Stages the harness, then the submitted sources over it
    ///
    /// `submitted` and `expected` are both sorted; the i-th submitted file lands at
    /// `src/<expected[i]>`, replacing any harness placeholder at that path.
    pub fn stage(
        config: &Config,
        user: &str,
        submitted: &[String],
        expected: &[String],
    ) -> Result<Self, SystemError> {
        let root = config.workspace_root.as_deref().map(|dir| config.resolve(dir));
        let workspace = Self::from_harness(&config.harness_path(), root.as_deref())?;
        let src_dir = workspace.src_dir();

        for (name, relative) in submitted.iter().zip(expected) {
            let from = submitted_file_path(config, user, name);
            if !from.is_file() {
                return Err(SystemError::MissingFile {
                    context: "stage",
                    path: from,
                });
            }

            let to = src_dir.join(relative);
            let io_err = |source| SystemError::Io {
                context: "stage",
                path: to.clone(),
                source,
            };
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
            fs::copy(&from, &to).map_err(io_err)?;
            log::debug!("Staged {} -> {}", from.display(), to.display());
        }

        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root().join("src")
    }

    /// Leaves the directory on disk for inspection and returns its path
    pub fn keep(self) -> PathBuf {
        self.dir.keep()
    }
}

/// Recursively copies `from` into `to`, merging with what is already there
fn copy_tree(from: &Path, to: &Path) -> Result<(), SystemError> {
    for entry in WalkDir::new(from).follow_links(true) {
        let entry = entry.map_err(|e| SystemError::Io {
            context: "copy_tree",
            path: e.path().unwrap_or(from).to_path_buf(),
            source: e.into(),
        })?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };

        let target = to.join(relative);
        let result = if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
        } else {
            fs::copy(entry.path(), &target).map(|_| ())
        };
        result.map_err(|source| SystemError::Io {
            context: "copy_tree",
            path: target,
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct Assignment {
        dir: TempDir,
        config: Config,
    }

    fn assignment() -> Assignment {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("_test/src/pkg")).unwrap();
        fs::write(root.join("_test/src/pkg/Stub.java"), "// placeholder\n").unwrap();
        fs::write(root.join("_test/src/pkg/StubTest.java"), "// tester\n").unwrap();
        fs::create_dir_all(root.join("s/alice")).unwrap();

        let config = Config {
            assignment_dir: root.to_path_buf(),
            ..Config::default()
        };
        Assignment { dir, config }
    }

    fn submit(assignment: &Assignment, name: &str, content: &str) {
        fs::write(assignment.dir.path().join("s/alice").join(name), content).unwrap();
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_stage_places_file_at_expected_path() {
        let a = assignment();
        submit(&a, "Foo.java", "class Foo {}");

        let ws = Workspace::stage(
            &a.config,
            "alice",
            &names(&["Foo.java"]),
            &names(&["pkg/Foo.java"]),
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(ws.src_dir().join("pkg/Foo.java")).unwrap(),
            "class Foo {}"
        );
        assert!(ws.src_dir().join("pkg/StubTest.java").is_file());
    }

    #[test]
    fn test_submission_overrides_harness_placeholder() {
        let a = assignment();
        submit(&a, "Stub.java", "class Stub { int real; }");

        let ws = Workspace::stage(
            &a.config,
            "alice",
            &names(&["Stub.java"]),
            &names(&["pkg/Stub.java"]),
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(ws.src_dir().join("pkg/Stub.java")).unwrap(),
            "class Stub { int real; }"
        );
    }

    #[test]
    fn test_positional_mapping_is_independent_of_input_order() {
        let a = assignment();
        submit(&a, "A.java", "A");
        submit(&a, "B.java", "B");
        submit(&a, "C.java", "C");

        let orders = [
            (["C.java", "A.java", "B.java"], ["x/C.java", "y/A.java", "z/B.java"]),
            (["B.java", "C.java", "A.java"], ["z/B.java", "x/C.java", "y/A.java"]),
            (["A.java", "B.java", "C.java"], ["y/A.java", "z/B.java", "x/C.java"]),
        ];

        let mut trees = Vec::new();
        for (submitted, expected) in orders {
            let mut submitted = names(&submitted);
            let mut expected = names(&expected);
            submitted.sort();
            expected.sort();

            let ws = Workspace::stage(&a.config, "alice", &submitted, &expected).unwrap();
            let tree: Vec<(String, String)> = expected
                .iter()
                .map(|rel| {
                    let content = fs::read_to_string(ws.src_dir().join(rel)).unwrap();
                    (rel.clone(), content)
                })
                .collect();
            trees.push(tree);
        }

        // sorted pairing: A.java->x/C.java, B.java->y/A.java, C.java->z/B.java
        assert_eq!(
            trees[0],
            vec![
                ("x/C.java".to_string(), "A".to_string()),
                ("y/A.java".to_string(), "B".to_string()),
                ("z/B.java".to_string(), "C".to_string()),
            ]
        );
        assert_eq!(trees[0], trees[1]);
        assert_eq!(trees[1], trees[2]);
    }

    #[test]
    fn test_missing_harness_is_a_system_error() {
        let a = assignment();
        fs::remove_dir_all(a.dir.path().join("_test")).unwrap();

        let err = Workspace::stage(&a.config, "alice", &[], &[]).unwrap_err();
        assert!(matches!(err, SystemError::MissingDirectory { .. }));
    }

    #[test]
    fn test_missing_submitted_file_is_a_system_error() {
        let a = assignment();

        let err = Workspace::stage(
            &a.config,
            "alice",
            &names(&["Ghost.java"]),
            &names(&["pkg/Ghost.java"]),
        )
        .unwrap_err();
        assert!(matches!(err, SystemError::MissingFile { .. }));
    }

    #[test]
    fn test_workspace_is_removed_on_drop_unless_kept() {
        let a = assignment();

        let ws = Workspace::stage(&a.config, "alice", &[], &[]).unwrap();
        let dropped = ws.root().to_path_buf();
        drop(ws);
        assert!(!dropped.exists());

        let kept = Workspace::stage(&a.config, "alice", &[], &[]).unwrap().keep();
        assert!(kept.join("src/pkg/Stub.java").is_file());
        fs::remove_dir_all(kept).unwrap();
    }
}
