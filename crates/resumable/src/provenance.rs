//! Source-control provenance captured into snapshots.
//!
//! To reproduce a run from a snapshot: export its `config`, check out
//! `git/commit_hash` on `git/branch`, write `git/diff` to a file and apply it
//! with `patch -p0 < path.diff`.

use serde::{Deserialize, Serialize};

/// Repository state at save time.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Provenance {
    #[serde(rename = "git/branch")]
    pub branch: String,
    #[serde(rename = "git/commit_hash")]
    pub commit: String,
    #[serde(rename = "git/commit_author")]
    pub author: String,
    #[serde(rename = "git/commit_message")]
    pub message: String,
    /// Uncommitted working-tree changes, without `a/` `b/` path prefixes
    #[serde(rename = "git/diff")]
    pub diff: String,
}

/// Trait for provenance sources.
///
/// Capture is best effort: providers log their own failures and return
/// `None` rather than failing the save.
pub trait ProvenanceProvider: Send + Sync {
    fn capture(&self) -> Option<Provenance>;
}

/// Provider returning a fixed record.
#[derive(Clone, Debug, Default)]
pub struct StaticProvenance(pub Option<Provenance>);

impl ProvenanceProvider for StaticProvenance {
    fn capture(&self) -> Option<Provenance> {
        self.0.clone()
    }
}

#[cfg(feature = "git")]
pub use self::git::GitProvenance;

#[cfg(feature = "git")]
mod git {
    use super::{Provenance, ProvenanceProvider};
    use crate::{CheckpointError, Result};
    use std::path::PathBuf;

    /// Reads provenance from the git repository containing `path`.
    #[derive(Clone, Debug)]
    pub struct GitProvenance {
        path: PathBuf,
    }

    impl GitProvenance {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        /// Provider for the repository containing the current directory.
        pub fn current_dir() -> Result<Self> {
            let dir = std::env::current_dir().map_err(|e| CheckpointError::storage(".", e))?;
            Ok(Self::new(dir))
        }

        fn read(&self) -> core::result::Result<Provenance, git2::Error> {
            let repo = git2::Repository::discover(&self.path)?;
            let head = repo.head()?;
            let branch = head.shorthand().unwrap_or("HEAD").to_string();
            let commit = head.peel_to_commit()?;

            let mut opts = git2::DiffOptions::new();
            opts.old_prefix("").new_prefix("");
            let diff = repo.diff_index_to_workdir(None, Some(&mut opts))?;

            let mut patch = String::new();
            diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
                if matches!(line.origin(), '+' | '-' | ' ') {
                    patch.push(line.origin());
                }
                patch.push_str(&String::from_utf8_lossy(line.content()));
                true
            })?;

            let author = commit.author().name().unwrap_or_default().to_string();
            let provenance = Provenance {
                branch,
                commit: commit.id().to_string(),
                author,
                message: commit.message().unwrap_or_default().to_string(),
                diff: patch,
            };
            Ok(provenance)
        }
    }

    impl ProvenanceProvider for GitProvenance {
        fn capture(&self) -> Option<Provenance> {
            match self.read() {
                Ok(provenance) => Some(provenance),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "Skipping git provenance: {}", e);
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_uses_git_keys() {
        let provenance = Provenance {
            branch: "main".into(),
            commit: "abc123".into(),
            author: "Ada".into(),
            message: "tune lr".into(),
            diff: "--- src/lib.rs\n".into(),
        };

        let value = serde_json::to_value(&provenance).unwrap();

        assert_eq!(value["git/branch"], "main");
        assert_eq!(value["git/commit_hash"], "abc123");
        assert_eq!(value["git/diff"], "--- src/lib.rs\n");
    }

    #[test]
    fn test_static_provider() {
        assert!(StaticProvenance(None).capture().is_none());
        let fixed = Provenance {
            branch: "dev".into(),
            ..Default::default()
        };
        assert_eq!(StaticProvenance(Some(fixed.clone())).capture(), Some(fixed));
    }

    #[cfg(feature = "git")]
    #[test]
    fn test_git_outside_repository_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        // tempdirs are not inside a repository unless TMPDIR is
        if git2::Repository::discover(dir.path()).is_err() {
            assert!(GitProvenance::new(dir.path()).capture().is_none());
        }
    }
}
