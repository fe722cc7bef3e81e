#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end pipeline scenarios over an in-memory repository and a
//! deterministic mock LLM. The mock derives every response from its
//! prompt, so a warm-cache run must be byte-identical to a cold one.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeZone, Utc};

use git_chronicle::cache::ArtifactCache;
use git_chronicle::cancel::CancelToken;
use git_chronicle::config::Config;
use git_chronicle::model::{ArtifactKind, ChangeKind, Commit, FileChange};
use git_chronicle::orchestrator::{
    ExistingArtifacts, Pipeline, ReleaseRequest, RunOptions, RunStep,
};
use git_chronicle::reader::{DiffSet, ReaderError, RepositoryReader};
use git_chronicle::{ChronicleError, LlmClient, LlmError, LlmRequest};

// 2025-01-20 00:00:00 UTC, a Monday.
const MONDAY: i64 = 1_737_331_200;
const DAY: i64 = 86_400;

fn instant(epoch: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch, 0).single().unwrap()
}

fn diff_for(path: &str, lines: usize) -> String {
    let mut body = format!(
        "diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n@@ -1,1 +1,{} @@\n",
        lines + 1
    );
    for i in 0..lines {
        body.push_str(&format!("+line {i}\n"));
    }
    body
}

#[derive(Clone)]
struct FakeCommit {
    fingerprint: &'static str,
    epoch: i64,
    message: &'static str,
    files: Vec<(&'static str, usize)>,
}

/// In-memory repository reader.
struct FakeReader {
    commits: Vec<FakeCommit>,
}

impl RepositoryReader for FakeReader {
    fn list_commits(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Commit>, ReaderError> {
        Ok(self
            .commits
            .iter()
            .filter(|c| instant(c.epoch) >= start && instant(c.epoch) < end)
            .map(|c| Commit {
                fingerprint: c.fingerprint.to_string(),
                author_ts: instant(c.epoch).fixed_offset(),
                message: c.message.to_string(),
                files: Vec::new(),
                insertions: 0,
                deletions: 0,
            })
            .collect())
    }

    fn diff_of(&self, fingerprint: &str) -> Result<DiffSet, ReaderError> {
        let commit = self
            .commits
            .iter()
            .find(|c| c.fingerprint == fingerprint)
            .ok_or_else(|| ReaderError::UnknownCommit(fingerprint.to_string()))?;
        let files: Vec<FileChange> = commit
            .files
            .iter()
            .map(|(path, lines)| FileChange {
                path: (*path).to_string(),
                kind: ChangeKind::Modified,
                diff: diff_for(path, *lines),
                is_binary: false,
                unreadable: false,
            })
            .collect();
        let insertions = commit.files.iter().map(|(_, l)| l).sum();
        Ok(DiffSet {
            files,
            insertions,
            deletions: 0,
        })
    }

    fn head_timezone(&self) -> FixedOffset {
        Utc.fix()
    }
}

/// Mock LLM whose answers are a pure function of the prompt.
struct DeterministicLlm {
    calls: AtomicUsize,
}

impl DeterministicLlm {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn tier1_response(prompt: &str) -> String {
        let message = prompt
            .split("Commit message:\n")
            .nth(1)
            .and_then(|rest| rest.split("\n\nFile diffs:").next())
            .unwrap_or("")
            .trim();
        let (category, description) = if let Some(rest) = message.strip_prefix("feat: ") {
            ("NEW_FEATURE", rest)
        } else if let Some(rest) = message.strip_prefix("fix: ") {
            ("BUG_FIX", rest)
        } else if let Some(rest) = message.strip_prefix("perf: ") {
            ("PERFORMANCE", rest)
        } else {
            ("OTHER", message)
        };
        format!(
            r#"{{"category": "{category}", "changes": [{{"description": "{description}", "category": "{category}", "impact": "medium", "file": "{description}", "line": 1}}]}}"#
        )
    }

    fn tier2_response(prompt: &str) -> String {
        let date = prompt
            .split("development work, ")
            .nth(1)
            .and_then(|rest| rest.split('.').next())
            .unwrap_or("an unknown day");
        let ids: Vec<&str> = prompt
            .lines()
            .filter(|line| line.starts_with("- ") && line.contains('[') && !line.contains("(trivial)"))
            .filter_map(|line| line.get(2..10))
            .collect();
        let achievements: Vec<String> = ids
            .iter()
            .map(|id| format!("\"{id}: completed work\""))
            .collect();
        format!(
            r#"{{"summary": "Steady progress on {date} across {} change(s).", "achievements": [{}]}}"#,
            ids.len(),
            achievements.join(", ")
        )
    }

    fn tier3_response(prompt: &str) -> String {
        let notable: Vec<String> = prompt
            .lines()
            .filter(|line| line.starts_with("- ") && line.contains("completed work"))
            .map(|line| format!("\"{}\"", line.trim_start_matches("- ").trim()))
            .collect();
        format!(
            r#"{{"title": "Week in review", "body": "The week moved forward commit by commit, each day building on the last.", "notable": [{}]}}"#,
            notable.join(", ")
        )
    }
}

impl LlmClient for DeterministicLlm {
    fn generate<'a>(
        &'a self,
        request: LlmRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String, LlmError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request.prompt;
        let response = if prompt.contains("analyzing a single git commit") {
            Self::tier1_response(prompt)
        } else if prompt.contains("summarizing one day") {
            Self::tier2_response(prompt)
        } else {
            Self::tier3_response(prompt)
        };
        Box::pin(async move { Ok(response) })
    }
}

/// Mock LLM whose calls never complete.
struct HangingLlm {
    calls: Arc<AtomicUsize>,
}

impl LlmClient for HangingLlm {
    fn generate<'a>(
        &'a self,
        _request: LlmRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String, LlmError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            std::future::pending::<()>().await;
            unreachable!()
        })
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    // generous buckets so rate limiting stays out of timing-free tests
    config.rate_per_min.fast = 6_000;
    config.rate_per_min.balanced = 6_000;
    config.rate_per_min.quality = 6_000;
    config.burst.fast = 100;
    config.burst.balanced = 100;
    config.burst.quality = 100;
    config
}

fn pipeline_with(
    commits: Vec<FakeCommit>,
    cache: Arc<ArtifactCache>,
) -> (Pipeline, Arc<DeterministicLlm>) {
    let client = Arc::new(DeterministicLlm::new());
    let pipeline = Pipeline::new(
        Arc::new(FakeReader { commits }),
        client.clone(),
        Arc::new(test_config()),
        cache,
    );
    (pipeline, client)
}

fn artifact_text(report: &git_chronicle::orchestrator::RunReport, kind: ArtifactKind) -> String {
    report
        .artifacts
        .iter()
        .find(|a| a.kind == kind)
        .map(|a| a.text.clone())
        .unwrap()
}

#[tokio::test]
async fn scenario_trivial_only_day() {
    let commits = vec![FakeCommit {
        fingerprint: "aaaa111122223333",
        epoch: MONDAY + 9 * 3_600,
        message: "chore: bump dependency",
        files: vec![("package.json", 3)],
    }];
    let cache = Arc::new(ArtifactCache::in_memory("v1", CancelToken::never()));
    let (pipeline, _client) = pipeline_with(commits, cache);

    let report = pipeline
        .run(RunOptions::new(instant(MONDAY), instant(MONDAY + 7 * DAY)))
        .await
        .unwrap();

    // prefix-filtered: no Tier-1 or Tier-2 calls at all
    assert_eq!(report.llm_calls.fast, 0);
    assert_eq!(report.llm_calls.balanced, 0);

    let daily = artifact_text(&report, ArtifactKind::Daily);
    assert!(daily.contains("## 2025-01-20"));
    assert!(daily.contains("minor maintenance"));

    let changelog = artifact_text(&report, ArtifactKind::Changelog);
    assert!(changelog.contains("## [Unreleased]"));
    assert!(
        !changelog.contains("- "),
        "trivial day must add no change log entries:\n{changelog}"
    );

    let narrative = artifact_text(&report, ArtifactKind::Narrative);
    assert!(narrative.contains("## Week of 2025-01-20"));
    assert!(
        !narrative.contains("Notable Changes"),
        "maintenance-only week lists nothing notable:\n{narrative}"
    );
}

#[tokio::test]
async fn scenario_two_commit_day() {
    let commits = vec![
        FakeCommit {
            fingerprint: "bbbb111122223333",
            epoch: MONDAY + 10 * 3_600,
            message: "feat: add login",
            files: vec![("src/login.rs", 80)],
        },
        FakeCommit {
            fingerprint: "cccc111122223333",
            epoch: MONDAY + 15 * 3_600,
            message: "fix: null pointer in login",
            files: vec![("src/login.rs", 10)],
        },
    ];
    let cache = Arc::new(ArtifactCache::in_memory("v1", CancelToken::never()));
    let (pipeline, _client) = pipeline_with(commits, cache);

    let report = pipeline
        .run(RunOptions::new(instant(MONDAY), instant(MONDAY + 7 * DAY)))
        .await
        .unwrap();

    assert_eq!(report.llm_calls.fast, 2, "one Tier-1 call per commit");
    assert_eq!(report.llm_calls.balanced, 1);

    let daily = artifact_text(&report, ArtifactKind::Daily);
    let first = daily.find("bbbb1111").expect("feature commit referenced");
    let second = daily.find("cccc1111").expect("fix commit referenced");
    assert!(
        first < second,
        "commits must appear in chronological order:\n{daily}"
    );

    let changelog = artifact_text(&report, ArtifactKind::Changelog);
    assert!(changelog.contains("### Added"));
    assert!(changelog.contains("add login"));
    assert!(changelog.contains("### Fixed"));
    assert!(changelog.contains("null pointer in login"));
}

#[tokio::test]
async fn no_commit_loss_across_days() {
    let commits = vec![
        FakeCommit {
            fingerprint: "d1d1d1d1d1d1d1d1",
            epoch: MONDAY + 3_600,
            message: "feat: parser groundwork",
            files: vec![("src/parser.rs", 20)],
        },
        FakeCommit {
            fingerprint: "d2d2d2d2d2d2d2d2",
            epoch: MONDAY + DAY + 3_600,
            message: "fix: parser offsets",
            files: vec![("src/parser.rs", 8)],
        },
        FakeCommit {
            fingerprint: "d3d3d3d3d3d3d3d3",
            epoch: MONDAY + 2 * DAY + 3_600,
            message: "perf: faster lexing",
            files: vec![("src/lexer.rs", 12)],
        },
    ];
    let cache = Arc::new(ArtifactCache::in_memory("v1", CancelToken::never()));
    let (pipeline, _client) = pipeline_with(commits.clone(), cache);

    let report = pipeline
        .run(RunOptions::new(instant(MONDAY), instant(MONDAY + 7 * DAY)))
        .await
        .unwrap();

    let daily = artifact_text(&report, ArtifactKind::Daily);
    for date in ["2025-01-20", "2025-01-21", "2025-01-22"] {
        assert!(daily.contains(&format!("## {date}")), "missing {date}");
    }
    for fingerprint in ["d1d1d1d1", "d2d2d2d2", "d3d3d3d3"] {
        assert!(
            daily.contains(fingerprint),
            "non-trivial commit {fingerprint} lost from daily artifact"
        );
    }
}

#[tokio::test]
async fn warm_cache_run_is_byte_identical_with_zero_calls() {
    let commits = vec![
        FakeCommit {
            fingerprint: "bbbb111122223333",
            epoch: MONDAY + 10 * 3_600,
            message: "feat: add login",
            files: vec![("src/login.rs", 30)],
        },
        FakeCommit {
            fingerprint: "cccc111122223333",
            epoch: MONDAY + DAY,
            message: "fix: null pointer in login",
            files: vec![("src/login.rs", 5)],
        },
    ];
    let dir = tempfile::tempdir().unwrap();

    let first = {
        let cache = Arc::new(ArtifactCache::open(dir.path(), "v1", CancelToken::never()).unwrap());
        let (pipeline, client) = pipeline_with(commits.clone(), cache);
        let report = pipeline
            .run(RunOptions::new(instant(MONDAY), instant(MONDAY + 7 * DAY)))
            .await
            .unwrap();
        assert!(client.calls.load(Ordering::SeqCst) > 0);
        report
    };

    let second = {
        let cache = Arc::new(ArtifactCache::open(dir.path(), "v1", CancelToken::never()).unwrap());
        let (pipeline, client) = pipeline_with(commits, cache);
        let report = pipeline
            .run(RunOptions::new(instant(MONDAY), instant(MONDAY + 7 * DAY)))
            .await
            .unwrap();
        assert_eq!(
            client.calls.load(Ordering::SeqCst),
            0,
            "warm cache must absorb every LLM call"
        );
        report
    };

    for kind in [ArtifactKind::Narrative, ArtifactKind::Changelog, ArtifactKind::Daily] {
        assert_eq!(
            artifact_text(&first, kind),
            artifact_text(&second, kind),
            "artifacts must be byte-identical under a warm cache"
        );
    }
}

#[tokio::test]
async fn resume_after_partial_run_only_recomputes_the_gap() {
    // Five commits on day one, five on day two, two on day three.
    let mut commits = Vec::new();
    let fingerprints = [
        "a0a0a0a0a0a0a0a0",
        "a1a1a1a1a1a1a1a1",
        "a2a2a2a2a2a2a2a2",
        "a3a3a3a3a3a3a3a3",
        "a4a4a4a4a4a4a4a4",
        "b0b0b0b0b0b0b0b0",
        "b1b1b1b1b1b1b1b1",
        "b2b2b2b2b2b2b2b2",
        "b3b3b3b3b3b3b3b3",
        "b4b4b4b4b4b4b4b4",
        "c0c0c0c0c0c0c0c0",
        "c1c1c1c1c1c1c1c1",
    ];
    for (i, fingerprint) in fingerprints.iter().enumerate() {
        let day = (i / 5) as i64;
        commits.push(FakeCommit {
            fingerprint,
            epoch: MONDAY + day * DAY + (i as i64 % 5) * 3_600 + 3_600,
            message: if i % 2 == 0 { "feat: add login" } else { "fix: null pointer in login" },
            files: vec![("src/app.rs", 6)],
        });
    }
    let dir = tempfile::tempdir().unwrap();

    // First run covers only the first ten commits (days one and two).
    {
        let cache = Arc::new(ArtifactCache::open(dir.path(), "v1", CancelToken::never()).unwrap());
        let (pipeline, _client) = pipeline_with(commits.clone(), cache);
        let report = pipeline
            .run(RunOptions::new(instant(MONDAY), instant(MONDAY + 2 * DAY)))
            .await
            .unwrap();
        assert_eq!(report.llm_calls.fast, 10);
    }

    // Second run covers the full range: only the two new commits and the
    // new day need fresh calls; the untouched days are cache hits.
    let resumed = {
        let cache = Arc::new(ArtifactCache::open(dir.path(), "v1", CancelToken::never()).unwrap());
        let (pipeline, _client) = pipeline_with(commits.clone(), cache);
        let report = pipeline
            .run(RunOptions::new(instant(MONDAY), instant(MONDAY + 7 * DAY)))
            .await
            .unwrap();
        assert_eq!(report.llm_calls.fast, 2, "ten Tier-1 results must come from cache");
        assert_eq!(report.llm_calls.balanced, 1, "only the new day synthesizes");
        report
    };

    // A clean full run produces identical artifacts.
    let clean = {
        let fresh_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ArtifactCache::open(fresh_dir.path(), "v1", CancelToken::never()).unwrap());
        let (pipeline, _client) = pipeline_with(commits, cache);
        pipeline
            .run(RunOptions::new(instant(MONDAY), instant(MONDAY + 7 * DAY)))
            .await
            .unwrap()
    };

    for kind in [ArtifactKind::Narrative, ArtifactKind::Changelog, ArtifactKind::Daily] {
        assert_eq!(artifact_text(&resumed, kind), artifact_text(&clean, kind));
    }
}

#[tokio::test]
async fn pre_release_moves_unreleased_and_marks_the_week() {
    let commits = vec![FakeCommit {
        fingerprint: "aaaa111122223333",
        epoch: MONDAY + 9 * 3_600,
        message: "chore: bump dependency",
        files: vec![("package.json", 3)],
    }];
    let cache = Arc::new(ArtifactCache::in_memory("v1", CancelToken::never()));
    let (pipeline, _client) = pipeline_with(commits, cache);

    let existing_changelog = "# Changelog\n\n## [Unreleased]\n\n### Added\n\n- ✨ add login\n\n### Fixed\n\n- 🐛 null pointer in login\n";
    let report = pipeline
        .run(RunOptions {
            start: instant(MONDAY),
            end: instant(MONDAY + 7 * DAY),
            existing: ExistingArtifacts {
                narrative: String::new(),
                changelog: existing_changelog.to_string(),
                daily: String::new(),
            },
            release: Some(ReleaseRequest {
                version: "1.2.3".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 1, 20).unwrap(),
            }),
            cancel: CancelToken::never(),
        })
        .await
        .unwrap();

    let changelog = artifact_text(&report, ArtifactKind::Changelog);
    let released_at = changelog.find("## [v1.2.3] - 2025-01-20").expect("release section");
    let unreleased_at = changelog.find("## [Unreleased]").unwrap();
    assert!(unreleased_at < released_at);
    // the two bullets moved into the release section
    let release_section = &changelog[released_at..];
    assert!(release_section.contains("- ✨ add login"));
    assert!(release_section.contains("- 🐛 null pointer in login"));
    // and the unreleased section is empty again
    let between = &changelog[unreleased_at..released_at];
    assert!(!between.contains("- "));

    let narrative = artifact_text(&report, ArtifactKind::Narrative);
    assert!(narrative.contains("## Week of 2025-01-20 — Released v1.2.3 🚀"));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_new_llm_calls_promptly() {
    let commits = vec![
        FakeCommit {
            fingerprint: "bbbb111122223333",
            epoch: MONDAY + 3_600,
            message: "feat: add login",
            files: vec![("src/login.rs", 10)],
        },
        FakeCommit {
            fingerprint: "cccc111122223333",
            epoch: MONDAY + 2 * 3_600,
            message: "fix: null pointer in login",
            files: vec![("src/login.rs", 4)],
        },
    ];
    let calls = Arc::new(AtomicUsize::new(0));
    let client = Arc::new(HangingLlm {
        calls: calls.clone(),
    });
    let mut config = test_config();
    config.concurrency.t1 = 1;
    let pipeline = Pipeline::new(
        Arc::new(FakeReader { commits }),
        client,
        Arc::new(config),
        Arc::new(ArtifactCache::in_memory("v1", CancelToken::never())),
    );

    let (handle, cancel) = CancelToken::new();
    let task = tokio::spawn(async move {
        pipeline
            .run(RunOptions {
                start: instant(MONDAY),
                end: instant(MONDAY + DAY),
                existing: ExistingArtifacts::default(),
                release: None,
                cancel,
            })
            .await
    });

    // let the first call get in flight, then cancel
    tokio::time::sleep(Duration::from_millis(20)).await;
    let in_flight = calls.load(Ordering::SeqCst);
    assert_eq!(in_flight, 1, "first Tier-1 call should be in flight");

    let canceled_at = tokio::time::Instant::now();
    handle.cancel();
    let failure = task.await.unwrap().unwrap_err();

    assert!(canceled_at.elapsed() <= Duration::from_millis(100));
    assert_eq!(failure.step, RunStep::Tier1);
    assert!(matches!(failure.source, ChronicleError::Canceled));
    assert_eq!(failure.source.exit_code(), 4);
    assert_eq!(
        calls.load(Ordering::SeqCst),
        in_flight,
        "no new LLM calls may begin after cancellation"
    );
}

#[tokio::test]
async fn merge_is_idempotent_across_reruns_into_own_output() {
    let commits = vec![FakeCommit {
        fingerprint: "bbbb111122223333",
        epoch: MONDAY + 3_600,
        message: "feat: add login",
        files: vec![("src/login.rs", 10)],
    }];
    let dir = tempfile::tempdir().unwrap();

    let first = {
        let cache = Arc::new(ArtifactCache::open(dir.path(), "v1", CancelToken::never()).unwrap());
        let (pipeline, _client) = pipeline_with(commits.clone(), cache);
        pipeline
            .run(RunOptions::new(instant(MONDAY), instant(MONDAY + DAY)))
            .await
            .unwrap()
    };

    // run again, merging into the artifacts the first run produced
    let second = {
        let cache = Arc::new(ArtifactCache::open(dir.path(), "v1", CancelToken::never()).unwrap());
        let (pipeline, _client) = pipeline_with(commits, cache);
        pipeline
            .run(RunOptions {
                start: instant(MONDAY),
                end: instant(MONDAY + DAY),
                existing: ExistingArtifacts {
                    narrative: artifact_text(&first, ArtifactKind::Narrative),
                    changelog: artifact_text(&first, ArtifactKind::Changelog),
                    daily: artifact_text(&first, ArtifactKind::Daily),
                },
                release: None,
                cancel: CancelToken::never(),
            })
            .await
            .unwrap()
    };

    for kind in [ArtifactKind::Narrative, ArtifactKind::Changelog, ArtifactKind::Daily] {
        assert_eq!(
            artifact_text(&first, kind),
            artifact_text(&second, kind),
            "merging into own output must be a fixed point"
        );
    }
}

#[tokio::test]
async fn unanalyzable_commit_degrades_to_trivial_with_note() {
    struct FailingDiffReader {
        inner: FakeReader,
        fail_for: HashSet<&'static str>,
    }

    impl RepositoryReader for FailingDiffReader {
        fn list_commits(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Commit>, ReaderError> {
            self.inner.list_commits(start, end)
        }

        fn diff_of(&self, fingerprint: &str) -> Result<DiffSet, ReaderError> {
            if self.fail_for.contains(fingerprint) {
                return Err(ReaderError::Diff {
                    fingerprint: fingerprint.to_string(),
                    message: "corrupt object".to_string(),
                });
            }
            self.inner.diff_of(fingerprint)
        }

        fn head_timezone(&self) -> FixedOffset {
            Utc.fix()
        }
    }

    let commits = vec![
        FakeCommit {
            fingerprint: "bbbb111122223333",
            epoch: MONDAY + 3_600,
            message: "feat: add login",
            files: vec![("src/login.rs", 10)],
        },
        FakeCommit {
            fingerprint: "eeee111122223333",
            epoch: MONDAY + 2 * 3_600,
            message: "mystery change",
            files: vec![("src/other.rs", 4)],
        },
    ];
    let reader = FailingDiffReader {
        inner: FakeReader {
            commits: commits.clone(),
        },
        fail_for: ["eeee111122223333"].into_iter().collect(),
    };
    let client = Arc::new(DeterministicLlm::new());
    let pipeline = Pipeline::new(
        Arc::new(reader),
        client,
        Arc::new(test_config()),
        Arc::new(ArtifactCache::in_memory("v1", CancelToken::never())),
    );

    let report = pipeline
        .run(RunOptions::new(instant(MONDAY), instant(MONDAY + DAY)))
        .await
        .unwrap();

    // the unanalyzable commit consumed no LLM budget but the run survived
    assert_eq!(report.llm_calls.fast, 1);
    let daily = artifact_text(&report, ArtifactKind::Daily);
    assert!(daily.contains("bbbb1111"));
}
