//! Repository reader interface and the git2 implementation.
//!
//! The pipeline consumes [`RepositoryReader`]; everything below it
//! (revwalks, tree diffs) stays in this module. Per-file diff failures
//! never fail a commit: the file is marked unreadable and carried with
//! an empty body.

use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};
use git2::{Delta, DiffOptions, Oid, Patch, Repository};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{ChangeKind, Commit, FileChange};

/// Failures reading version-control data.
#[derive(Error, Debug)]
pub enum ReaderError {
    /// The repository could not be opened.
    #[error("failed to open repository: {0}")]
    Open(String),

    /// History traversal failed.
    #[error("failed to walk history: {0}")]
    History(String),

    /// A commit id did not resolve.
    #[error("unknown commit '{0}'")]
    UnknownCommit(String),

    /// Diff computation failed for a whole commit.
    #[error("failed to diff commit '{fingerprint}': {message}")]
    Diff {
        /// Commit whose diff failed.
        fingerprint: String,
        /// Underlying failure.
        message: String,
    },
}

/// Per-commit diff result.
#[derive(Debug, Clone, Default)]
pub struct DiffSet {
    /// Per-file changes in the order the repository reported them.
    pub files: Vec<FileChange>,
    /// Total inserted lines.
    pub insertions: usize,
    /// Total deleted lines.
    pub deletions: usize,
}

/// Read-only view of a repository's history.
pub trait RepositoryReader: Send + Sync {
    /// Commits with `author_ts` in `[start, end)`, ascending by author
    /// time and tie-broken by fingerprint. File lists are empty; callers
    /// attach diffs via [`RepositoryReader::diff_of`].
    fn list_commits(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Commit>, ReaderError>;

    /// Per-file changes of one commit.
    fn diff_of(&self, fingerprint: &str) -> Result<DiffSet, ReaderError>;

    /// UTC offset of the current HEAD commit's author.
    fn head_timezone(&self) -> FixedOffset;
}

/// [`RepositoryReader`] backed by git2.
pub struct GitReader {
    repo: Mutex<Repository>,
}

impl GitReader {
    /// Opens the repository at `path`.
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        let repo = Repository::open(path).map_err(|e| ReaderError::Open(e.to_string()))?;
        Ok(Self {
            repo: Mutex::new(repo),
        })
    }

    fn with_repo<T>(&self, f: impl FnOnce(&Repository) -> T) -> T {
        let guard = match self.repo.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&guard)
    }
}

/// Converts a git2 timestamp to a fixed-offset datetime.
fn to_datetime(time: git2::Time) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(time.offset_minutes() * 60)
        .unwrap_or_else(|| Utc.fix());
    DateTime::<Utc>::from_timestamp(time.seconds(), 0)
        .unwrap_or_default()
        .with_timezone(&offset)
}

fn change_kind(status: Delta) -> ChangeKind {
    match status {
        Delta::Added | Delta::Copied | Delta::Untracked => ChangeKind::Added,
        Delta::Deleted => ChangeKind::Deleted,
        Delta::Renamed => ChangeKind::Renamed,
        _ => ChangeKind::Modified,
    }
}

impl RepositoryReader for GitReader {
    fn list_commits(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Commit>, ReaderError> {
        self.with_repo(|repo| {
            let mut walk = repo
                .revwalk()
                .map_err(|e| ReaderError::History(e.to_string()))?;
            walk.push_head()
                .map_err(|e| ReaderError::History(e.to_string()))?;

            let mut commits = Vec::new();
            for oid in walk {
                let oid = oid.map_err(|e| ReaderError::History(e.to_string()))?;
                let commit = repo
                    .find_commit(oid)
                    .map_err(|e| ReaderError::History(e.to_string()))?;
                let author_ts = to_datetime(commit.author().when());
                let utc = author_ts.with_timezone(&Utc);
                if utc < start || utc >= end {
                    continue;
                }
                commits.push(Commit {
                    fingerprint: oid.to_string(),
                    author_ts,
                    message: commit.message().unwrap_or_default().to_string(),
                    files: Vec::new(),
                    insertions: 0,
                    deletions: 0,
                });
            }

            commits.sort_by(|a, b| {
                a.author_ts
                    .with_timezone(&Utc)
                    .cmp(&b.author_ts.with_timezone(&Utc))
                    .then_with(|| a.fingerprint.cmp(&b.fingerprint))
            });
            debug!(count = commits.len(), "extracted commits");
            Ok(commits)
        })
    }

    fn diff_of(&self, fingerprint: &str) -> Result<DiffSet, ReaderError> {
        self.with_repo(|repo| {
            let oid = Oid::from_str(fingerprint)
                .map_err(|_| ReaderError::UnknownCommit(fingerprint.to_string()))?;
            let commit = repo
                .find_commit(oid)
                .map_err(|_| ReaderError::UnknownCommit(fingerprint.to_string()))?;
            let tree = commit.tree().map_err(|e| ReaderError::Diff {
                fingerprint: fingerprint.to_string(),
                message: e.to_string(),
            })?;
            let parent_tree = commit.parent(0).and_then(|p| p.tree()).ok();

            let mut opts = DiffOptions::new();
            opts.context_lines(3);
            let diff = repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))
                .map_err(|e| ReaderError::Diff {
                    fingerprint: fingerprint.to_string(),
                    message: e.to_string(),
                })?;

            let mut set = DiffSet::default();
            if let Ok(stats) = diff.stats() {
                set.insertions = stats.insertions();
                set.deletions = stats.deletions();
            }

            for (index, delta) in diff.deltas().enumerate() {
                let path = delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map_or_else(String::new, |p| p.display().to_string());
                let kind = change_kind(delta.status());

                // A failed patch marks the file unreadable; the commit is
                // still returned.
                let (body, is_binary, unreadable) = match Patch::from_diff(&diff, index) {
                    Ok(Some(mut patch)) => match patch.to_buf() {
                        Ok(buf) => (
                            buf.as_str().unwrap_or_default().to_string(),
                            false,
                            false,
                        ),
                        Err(e) => {
                            warn!(path = %path, error = %e, "failed to render file diff");
                            (String::new(), false, true)
                        }
                    },
                    Ok(None) => (String::new(), true, false),
                    Err(e) => {
                        warn!(path = %path, error = %e, "failed to compute file diff");
                        (String::new(), false, true)
                    }
                };

                set.files.push(FileChange {
                    path,
                    kind,
                    diff: body,
                    is_binary,
                    unreadable,
                });
            }
            Ok(set)
        })
    }

    fn head_timezone(&self) -> FixedOffset {
        self.with_repo(|repo| {
            repo.head()
                .and_then(|head| head.peel_to_commit())
                .map(|commit| to_datetime(commit.author().when()).timezone())
                .unwrap_or_else(|_| Utc.fix())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use git2::{Signature, Time};
    use tempfile::TempDir;

    use super::*;

    /// Builds a repository and commits files with controlled author times.
    struct RepoFixture {
        dir: TempDir,
        repo: Repository,
    }

    impl RepoFixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let repo = Repository::init(dir.path()).unwrap();
            Self { dir, repo }
        }

        fn commit(&self, message: &str, epoch: i64, offset_minutes: i32, files: &[(&str, &str)]) -> String {
            for (name, content) in files {
                std::fs::write(self.dir.path().join(name), content).unwrap();
            }
            let mut index = self.repo.index().unwrap();
            for (name, _) in files {
                index.add_path(Path::new(name)).unwrap();
            }
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = self.repo.find_tree(tree_id).unwrap();
            let sig = Signature::new(
                "Dev",
                "dev@example.com",
                &Time::new(epoch, offset_minutes),
            )
            .unwrap();
            let parent = self
                .repo
                .head()
                .ok()
                .and_then(|h| h.peel_to_commit().ok());
            let parents: Vec<&git2::Commit> = parent.iter().collect();
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
                .unwrap()
                .to_string()
        }
    }

    const T0: i64 = 1_737_331_200; // 2025-01-20 00:00:00 UTC

    #[test]
    fn lists_commits_in_window_ascending() {
        let fixture = RepoFixture::new();
        fixture.commit("first", T0, 0, &[("a.txt", "one\n")]);
        fixture.commit("second", T0 + 3_600, 0, &[("a.txt", "one\ntwo\n")]);
        fixture.commit("outside", T0 + 900_000, 0, &[("a.txt", "three\n")]);

        let reader = GitReader::open(fixture.dir.path()).unwrap();
        let start = Utc.timestamp_opt(T0, 0).single().unwrap();
        let end = Utc.timestamp_opt(T0 + 86_400, 0).single().unwrap();
        let commits = reader.list_commits(start, end).unwrap();

        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "first");
        assert_eq!(commits[1].message, "second");
    }

    #[test]
    fn window_end_is_exclusive() {
        let fixture = RepoFixture::new();
        fixture.commit("at start", T0, 0, &[("a.txt", "x\n")]);
        fixture.commit("at end", T0 + 100, 0, &[("b.txt", "y\n")]);

        let reader = GitReader::open(fixture.dir.path()).unwrap();
        let start = Utc.timestamp_opt(T0, 0).single().unwrap();
        let end = Utc.timestamp_opt(T0 + 100, 0).single().unwrap();
        let commits = reader.list_commits(start, end).unwrap();

        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].message, "at start");
    }

    #[test]
    fn equal_timestamps_tie_break_on_fingerprint() {
        let fixture = RepoFixture::new();
        fixture.commit("a", T0, 0, &[("a.txt", "1\n")]);
        fixture.commit("b", T0, 0, &[("b.txt", "2\n")]);

        let reader = GitReader::open(fixture.dir.path()).unwrap();
        let start = Utc.timestamp_opt(T0 - 10, 0).single().unwrap();
        let end = Utc.timestamp_opt(T0 + 10, 0).single().unwrap();
        let commits = reader.list_commits(start, end).unwrap();

        assert_eq!(commits.len(), 2);
        assert!(commits[0].fingerprint < commits[1].fingerprint);
    }

    #[test]
    fn diff_of_reports_file_changes() {
        let fixture = RepoFixture::new();
        let first = fixture.commit("add file", T0, 0, &[("src.rs", "fn main() {}\n")]);
        let second = fixture.commit(
            "extend file",
            T0 + 60,
            0,
            &[("src.rs", "fn main() {}\nfn helper() {}\n")],
        );

        let reader = GitReader::open(fixture.dir.path()).unwrap();

        let initial = reader.diff_of(&first).unwrap();
        assert_eq!(initial.files.len(), 1);
        assert_eq!(initial.files[0].kind, ChangeKind::Added);
        assert!(initial.files[0].diff.contains("+fn main() {}"));

        let followup = reader.diff_of(&second).unwrap();
        assert_eq!(followup.files[0].kind, ChangeKind::Modified);
        assert!(followup.files[0].diff.contains("+fn helper() {}"));
        assert_eq!(followup.insertions, 1);
        assert_eq!(followup.deletions, 0);
    }

    #[test]
    fn unknown_commit_is_an_error() {
        let fixture = RepoFixture::new();
        fixture.commit("only", T0, 0, &[("a.txt", "x\n")]);
        let reader = GitReader::open(fixture.dir.path()).unwrap();
        let err = reader.diff_of("not-a-hash").unwrap_err();
        assert!(matches!(err, ReaderError::UnknownCommit(_)));
    }

    #[test]
    fn head_timezone_reflects_last_author() {
        let fixture = RepoFixture::new();
        fixture.commit("offset commit", T0, 120, &[("a.txt", "x\n")]);
        let reader = GitReader::open(fixture.dir.path()).unwrap();
        assert_eq!(reader.head_timezone().local_minus_utc(), 120 * 60);
    }

    #[test]
    fn author_timestamp_preserves_offset() {
        let fixture = RepoFixture::new();
        fixture.commit("offset commit", T0, -300, &[("a.txt", "x\n")]);
        let reader = GitReader::open(fixture.dir.path()).unwrap();
        let start = Utc.timestamp_opt(T0 - 10, 0).single().unwrap();
        let end = Utc.timestamp_opt(T0 + 10, 0).single().unwrap();
        let commits = reader.list_commits(start, end).unwrap();
        assert_eq!(commits[0].author_ts.offset().local_minus_utc(), -300 * 60);
        assert_eq!(commits[0].author_ts.with_timezone(&Utc).timestamp(), T0);
    }
}
