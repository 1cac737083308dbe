use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::errors::Result;
use crate::models::{
    FileChangeRow, FileChangeUpsert, IssueRow, MinerEvaluationInsert, MinerEvaluationRow, MinerId,
    MinerRow, PullRequestRow, PullRequestUpsert, RepositoryRow, RepositoryUpsert,
};

#[async_trait]
pub trait RepoRepository: Send + Sync {
    /// Idempotent by `full_name`; repeated identical input is a no-op beyond
    /// refreshing `updated_at`.
    async fn upsert(&self, repo: RepositoryUpsert) -> Result<()>;
    /// Single-statement batch upsert. Rows sharing a `full_name` are deduped
    /// before the write; the last occurrence wins.
    async fn upsert_bulk(&self, repos: Vec<RepositoryUpsert>) -> Result<u64>;
    async fn get(&self, full_name: &str) -> Result<Option<RepositoryRow>>;
    async fn list(&self) -> Result<Vec<RepositoryRow>>;
    /// Destructive: cascades to every dependent pull request, issue, and
    /// file change in one atomic statement. Returns whether a row existed.
    async fn delete(&self, full_name: &str) -> Result<bool>;
}

#[async_trait]
pub trait MinerRepository: Send + Sync {
    /// Registers an identity triple. A conflict on the full triple only
    /// refreshes `updated_at`; rotation is a new triple, never a mutation.
    async fn upsert(&self, id: MinerId) -> Result<()>;
    /// Single-statement batch registration; duplicate triples in the batch
    /// are collapsed before the write.
    async fn upsert_bulk(&self, ids: Vec<MinerId>) -> Result<u64>;
    async fn get(&self, id: &MinerId) -> Result<Option<MinerRow>>;
    /// Identity-rotation history for a network slot.
    async fn list_by_uid(&self, uid: i32) -> Result<Vec<MinerRow>>;
    async fn list_by_hotkey(&self, hotkey: &str) -> Result<Vec<MinerRow>>;
    async fn list_by_github_id(&self, github_id: &str) -> Result<Vec<MinerRow>>;
    /// Newest triple registered for this (hotkey, platform account) pair.
    async fn get_by_hotkey_and_github_id(
        &self,
        hotkey: &str,
        github_id: &str,
    ) -> Result<Option<MinerRow>>;
    async fn list(&self) -> Result<Vec<MinerRow>>;
    /// Cascades to pull requests and evaluations authored under this triple.
    async fn delete(&self, id: &MinerId) -> Result<bool>;
}

#[async_trait]
pub trait PullRequestRepository: Send + Sync {
    /// Requires the repository and miner rows to exist already; fails with
    /// `ReferentialIntegrity` otherwise. A conflict on the key refreshes
    /// merge state, diff stats, and score, but never reattributes the miner.
    async fn upsert(&self, pr: PullRequestUpsert) -> Result<()>;
    /// Single-statement batch upsert; returns the number of rows written.
    /// Rows sharing a `(number, repository_full_name)` key are deduped
    /// before the write, last occurrence winning.
    async fn upsert_bulk(&self, prs: Vec<PullRequestUpsert>) -> Result<u64>;
    /// Applied repeatedly as the scoring algorithm re-evaluates a PR; the
    /// store persists the value without interpreting it.
    async fn set_earned_score(
        &self,
        number: i64,
        repository_full_name: &str,
        earned_score: Decimal,
    ) -> Result<bool>;
    async fn get(&self, number: i64, repository_full_name: &str)
        -> Result<Option<PullRequestRow>>;
    async fn get_with_file_changes(
        &self,
        number: i64,
        repository_full_name: &str,
    ) -> Result<Option<(PullRequestRow, Vec<FileChangeRow>)>>;
    async fn list_by_repository(&self, repository_full_name: &str)
        -> Result<Vec<PullRequestRow>>;
    async fn list_by_miner(&self, miner: &MinerId) -> Result<Vec<PullRequestRow>>;
}

#[async_trait]
pub trait IssueRepository: Send + Sync {
    /// Requires the linked pull request to exist. `created_at` and
    /// `closed_at` may both be null (incomplete upstream data).
    async fn upsert(&self, issue: IssueRow) -> Result<()>;
    /// Single-statement batch upsert, deduped by
    /// `(number, repository_full_name)` with the last occurrence winning.
    async fn upsert_bulk(&self, issues: Vec<IssueRow>) -> Result<u64>;
    async fn get(&self, number: i64, repository_full_name: &str) -> Result<Option<IssueRow>>;
    async fn list_by_repository(&self, repository_full_name: &str) -> Result<Vec<IssueRow>>;
    async fn list_by_pull_request(
        &self,
        pr_number: i64,
        repository_full_name: &str,
    ) -> Result<Vec<IssueRow>>;
}

#[async_trait]
pub trait FileChangeRepository: Send + Sync {
    /// Keyed by `(pr_number, repository_full_name, filename)`; a re-fetch of
    /// the same file's diff replaces the prior row's mutable fields.
    async fn upsert(&self, change: FileChangeUpsert) -> Result<()>;
    /// Stores a whole re-fetched diff in one statement, deduped by
    /// `(pr_number, repository_full_name, filename)`, last occurrence
    /// winning.
    async fn upsert_bulk(&self, changes: Vec<FileChangeUpsert>) -> Result<u64>;
    async fn get(&self, id: i64) -> Result<Option<FileChangeRow>>;
    async fn list_by_pull_request(
        &self,
        pr_number: i64,
        repository_full_name: &str,
    ) -> Result<Vec<FileChangeRow>>;
}

/// Append-only scoring snapshots; there is no update operation.
#[async_trait]
pub trait MinerEvaluationRepository: Send + Sync {
    /// Fails with `DuplicateEvaluation` when an evaluation already exists for
    /// the same `(uid, hotkey)` at the same timestamp; the stored row wins.
    async fn insert(&self, evaluation: MinerEvaluationInsert) -> Result<MinerEvaluationRow>;
    async fn get(&self, id: i64) -> Result<Option<MinerEvaluationRow>>;
    async fn latest(&self, uid: i32, hotkey: &str) -> Result<Option<MinerEvaluationRow>>;
    /// Latest evaluation per `(uid, hotkey)` across the whole table; the
    /// primary read for current standings.
    async fn latest_all(&self) -> Result<Vec<MinerEvaluationRow>>;
    async fn list_by_timeframe(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MinerEvaluationRow>>;
}

pub trait Repositories: Send + Sync {
    fn repos(&self) -> &dyn RepoRepository;
    fn miners(&self) -> &dyn MinerRepository;
    fn pull_requests(&self) -> &dyn PullRequestRepository;
    fn issues(&self) -> &dyn IssueRepository;
    fn file_changes(&self) -> &dyn FileChangeRepository;
    fn evaluations(&self) -> &dyn MinerEvaluationRepository;
}
