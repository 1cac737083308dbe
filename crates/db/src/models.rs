use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::errors::{DbError, Result};

/// Miner identity triple: network slot, cryptographic key, hosting-platform
/// account. Referenced as a unit by pull requests and evaluations; key
/// rotation appends a new triple rather than mutating an existing row, so
/// historical attribution stays with the triple that earned it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, FromRow)]
pub struct MinerId {
    pub uid: i32,
    pub hotkey: String,
    pub github_id: String,
}

impl MinerId {
    pub fn new(uid: i32, hotkey: impl Into<String>, github_id: impl Into<String>) -> Self {
        Self {
            uid,
            hotkey: hotkey.into(),
            github_id: github_id.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.uid < 0 {
            return Err(DbError::InvalidIdentity { uid: self.uid });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MinerRow {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub id: MinerId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryUpsert {
    pub full_name: String,
    pub name: String,
    pub owner: String,
}

impl RepositoryUpsert {
    /// Split "owner/name" into its redundant columns. Returns `None` when the
    /// input has no slash.
    pub fn from_full_name(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            full_name: full_name.to_owned(),
            name: name.to_owned(),
            owner: owner.to_owned(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RepositoryRow {
    pub full_name: String,
    pub name: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestUpsert {
    pub number: i64,
    pub repository_full_name: String,
    pub miner: MinerId,
    pub title: String,
    pub author_login: String,
    pub pr_created_at: DateTime<Utc>,
    /// `None` means the pull request is open or draft.
    pub merged_at: Option<DateTime<Utc>>,
    pub merged_by_login: Option<String>,
    pub earned_score: Decimal,
    pub additions: i32,
    pub deletions: i32,
    pub commits: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PullRequestRow {
    pub number: i64,
    pub repository_full_name: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub miner: MinerId,
    pub earned_score: Decimal,
    pub title: String,
    pub merged_at: Option<DateTime<Utc>>,
    pub pr_created_at: DateTime<Utc>,
    pub additions: i32,
    pub deletions: i32,
    pub commits: i32,
    pub author_login: String,
    pub merged_by_login: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PullRequestRow {
    pub fn total_changes(&self) -> i64 {
        i64::from(self.additions) + i64::from(self.deletions)
    }

    pub fn is_merged(&self) -> bool {
        self.merged_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IssueRow {
    pub number: i64,
    pub repository_full_name: String,
    pub pr_number: i64,
    pub title: String,
    /// Nullable: the upstream API omits these for some issues.
    pub created_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeUpsert {
    pub pr_number: i64,
    pub repository_full_name: String,
    pub filename: String,
    pub changes: i32,
    pub additions: i32,
    pub deletions: i32,
    pub status: String,
    /// Derived from the filename when not supplied.
    pub file_extension: Option<String>,
    pub patch: Option<String>,
}

impl FileChangeUpsert {
    pub fn resolved_extension(&self) -> String {
        self.file_extension
            .clone()
            .unwrap_or_else(|| file_extension_of(&self.filename))
    }
}

/// Lowercased text after the last dot, empty when the filename has none.
pub fn file_extension_of(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileChangeRow {
    pub id: i64,
    pub pr_number: i64,
    pub repository_full_name: String,
    pub filename: String,
    pub changes: i32,
    pub additions: i32,
    pub deletions: i32,
    pub status: String,
    pub file_extension: String,
    pub patch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub total_score: Decimal,
    pub total_lines_changed: i32,
    pub total_open_prs: i32,
    pub total_prs: i32,
    pub unique_repos_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerEvaluationInsert {
    pub miner: MinerId,
    /// Non-null marks a failed evaluation run; metrics are stored as zero.
    pub failed_reason: Option<String>,
    pub metrics: EvaluationMetrics,
    /// `None` lets the database stamp the evaluation-run time.
    pub evaluation_timestamp: Option<DateTime<Utc>>,
}

impl MinerEvaluationInsert {
    pub fn completed(miner: MinerId, metrics: EvaluationMetrics) -> Self {
        Self {
            miner,
            failed_reason: None,
            metrics,
            evaluation_timestamp: None,
        }
    }

    pub fn failed(miner: MinerId, reason: impl Into<String>) -> Self {
        Self {
            miner,
            failed_reason: Some(reason.into()),
            metrics: EvaluationMetrics::default(),
            evaluation_timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MinerEvaluationRow {
    pub id: i64,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub miner: MinerId,
    pub failed_reason: Option<String>,
    pub total_score: Decimal,
    pub total_lines_changed: i32,
    pub total_open_prs: i32,
    pub total_prs: i32,
    pub unique_repos_count: i32,
    pub evaluation_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miner_id_rejects_negative_uid() {
        let miner = MinerId::new(-1, "hk", "gh");
        assert!(matches!(
            miner.validate(),
            Err(DbError::InvalidIdentity { uid: -1 })
        ));
        assert!(MinerId::new(0, "hk", "gh").validate().is_ok());
    }

    #[test]
    fn repository_upsert_splits_full_name() {
        let repo = RepositoryUpsert::from_full_name("acme/widgets").expect("valid full name");
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "widgets");
        assert!(RepositoryUpsert::from_full_name("no-slash").is_none());
        assert!(RepositoryUpsert::from_full_name("/dangling").is_none());
    }

    #[test]
    fn file_extension_uses_last_dot_segment() {
        assert_eq!(file_extension_of("a.PY"), "py");
        assert_eq!(file_extension_of("archive.tar.gz"), "gz");
        assert_eq!(file_extension_of("Makefile"), "");
    }

    #[test]
    fn resolved_extension_prefers_explicit_value() {
        let mut change = FileChangeUpsert {
            pr_number: 1,
            repository_full_name: "acme/widgets".into(),
            filename: "src/lib.rs".into(),
            changes: 3,
            additions: 2,
            deletions: 1,
            status: "modified".into(),
            file_extension: None,
            patch: None,
        };
        assert_eq!(change.resolved_extension(), "rs");
        change.file_extension = Some("rust".into());
        assert_eq!(change.resolved_extension(), "rust");
    }

    #[test]
    fn failed_evaluation_zeroes_metrics() {
        let insert = MinerEvaluationInsert::failed(MinerId::new(7, "hk", "gh"), "timeout");
        assert_eq!(insert.metrics.total_prs, 0);
        assert_eq!(insert.metrics.total_score, Decimal::ZERO);
        assert!(insert.failed_reason.is_some());
    }
}
