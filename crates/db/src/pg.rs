use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use tokio::time::{sleep, Duration};
use tracing::{instrument, warn};

use common::DatabaseConfig;

use crate::errors::{DbError, Result};
use crate::models::{
    EvaluationMetrics, FileChangeRow, FileChangeUpsert, IssueRow, MinerEvaluationInsert,
    MinerEvaluationRow, MinerId, MinerRow, PullRequestRow, PullRequestUpsert, RepositoryRow,
    RepositoryUpsert,
};
use crate::repositories::{
    FileChangeRepository, IssueRepository, MinerEvaluationRepository, MinerRepository,
    PullRequestRepository, Repositories, RepoRepository,
};

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(DbError::Migration)
}

#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
    repo_repo: Arc<PgRepoRepository>,
    miner_repo: Arc<PgMinerRepository>,
    pull_request_repo: Arc<PgPullRequestRepository>,
    issue_repo: Arc<PgIssueRepository>,
    file_change_repo: Arc<PgFileChangeRepository>,
    evaluation_repo: Arc<PgMinerEvaluationRepository>,
}

impl PgDatabase {
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(database_url, 10).await
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::connect_with(&config.url, config.max_connections).await
    }

    async fn connect_with(database_url: &str, max_connections: u32) -> Result<Self> {
        const MAX_ATTEMPTS: u32 = 5;
        const BASE_DELAY_MS: u64 = 500;

        let mut attempts = 0;
        loop {
            match PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    run_migrations(&pool).await?;
                    return Ok(Self::from_pool(pool));
                }
                Err(err) => {
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        return Err(DbError::Query(err));
                    }

                    let exp = (attempts - 1).min(5);
                    let backoff = Duration::from_millis(BASE_DELAY_MS * (1u64 << exp));
                    warn!(
                        attempts,
                        error = %err,
                        wait_ms = backoff.as_millis(),
                        "database connection failed; retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        let repo_repo = Arc::new(PgRepoRepository { pool: pool.clone() });
        let miner_repo = Arc::new(PgMinerRepository { pool: pool.clone() });
        let pull_request_repo = Arc::new(PgPullRequestRepository { pool: pool.clone() });
        let issue_repo = Arc::new(PgIssueRepository { pool: pool.clone() });
        let file_change_repo = Arc::new(PgFileChangeRepository { pool: pool.clone() });
        let evaluation_repo = Arc::new(PgMinerEvaluationRepository { pool: pool.clone() });

        Self {
            pool,
            repo_repo,
            miner_repo,
            pull_request_repo,
            issue_repo,
            file_change_repo,
            evaluation_repo,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Repositories for PgDatabase {
    fn repos(&self) -> &dyn RepoRepository {
        &*self.repo_repo
    }

    fn miners(&self) -> &dyn MinerRepository {
        &*self.miner_repo
    }

    fn pull_requests(&self) -> &dyn PullRequestRepository {
        &*self.pull_request_repo
    }

    fn issues(&self) -> &dyn IssueRepository {
        &*self.issue_repo
    }

    fn file_changes(&self) -> &dyn FileChangeRepository {
        &*self.file_change_repo
    }

    fn evaluations(&self) -> &dyn MinerEvaluationRepository {
        &*self.evaluation_repo
    }
}

#[derive(Clone)]
struct PgRepoRepository {
    pool: PgPool,
}

#[async_trait]
impl RepoRepository for PgRepoRepository {
    #[instrument(skip(self, repo), fields(full_name = %repo.full_name))]
    async fn upsert(&self, repo: RepositoryUpsert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repositories (full_name, name, owner)
            VALUES ($1, $2, $3)
            ON CONFLICT (full_name) DO UPDATE
                SET name = EXCLUDED.name,
                    owner = EXCLUDED.owner,
                    updated_at = now()
            "#,
        )
        .bind(repo.full_name)
        .bind(repo.name)
        .bind(repo.owner)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(DbError::from_write)
    }

    #[instrument(skip(self, repos), fields(count = repos.len()))]
    async fn upsert_bulk(&self, repos: Vec<RepositoryUpsert>) -> Result<u64> {
        if repos.is_empty() {
            return Ok(0);
        }
        // ON CONFLICT DO UPDATE cannot touch a row twice in one statement,
        // so collapse duplicate keys first; the last occurrence wins.
        let mut by_key: HashMap<String, RepositoryUpsert> = HashMap::new();
        for repo in repos {
            by_key.insert(repo.full_name.clone(), repo);
        }

        let mut builder =
            QueryBuilder::<Postgres>::new("INSERT INTO repositories (full_name, name, owner) ");
        builder.push_values(by_key.into_values(), |mut row, repo| {
            row.push_bind(repo.full_name)
                .push_bind(repo.name)
                .push_bind(repo.owner);
        });
        builder.push(
            " ON CONFLICT (full_name) DO UPDATE \
             SET name = EXCLUDED.name, \
                 owner = EXCLUDED.owner, \
                 updated_at = now()",
        );

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(DbError::from_write)?;
        Ok(result.rows_affected())
    }

    async fn get(&self, full_name: &str) -> Result<Option<RepositoryRow>> {
        sqlx::query_as::<_, RepositoryRow>(
            r#"
            SELECT full_name, name, owner, created_at, updated_at
            FROM repositories
            WHERE full_name = $1
            "#,
        )
        .bind(full_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list(&self) -> Result<Vec<RepositoryRow>> {
        sqlx::query_as::<_, RepositoryRow>(
            r#"
            SELECT full_name, name, owner, created_at, updated_at
            FROM repositories
            ORDER BY full_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    #[instrument(skip(self))]
    async fn delete(&self, full_name: &str) -> Result<bool> {
        // Single statement; the ON DELETE CASCADE chain removes dependent
        // pull requests, issues, and file changes atomically.
        let result = sqlx::query("DELETE FROM repositories WHERE full_name = $1")
            .bind(full_name)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
struct PgMinerRepository {
    pool: PgPool,
}

#[async_trait]
impl MinerRepository for PgMinerRepository {
    #[instrument(skip(self, id), fields(uid = id.uid))]
    async fn upsert(&self, id: MinerId) -> Result<()> {
        id.validate()?;
        sqlx::query(
            r#"
            INSERT INTO miners (uid, hotkey, github_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (uid, hotkey, github_id) DO UPDATE
                SET updated_at = now()
            "#,
        )
        .bind(id.uid)
        .bind(id.hotkey)
        .bind(id.github_id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(DbError::from_write)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn upsert_bulk(&self, ids: Vec<MinerId>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        for id in &ids {
            id.validate()?;
        }
        // Collapse repeated triples; one statement may not hit a row twice.
        let mut by_key: HashMap<MinerId, MinerId> = HashMap::new();
        for id in ids {
            by_key.insert(id.clone(), id);
        }

        let mut builder =
            QueryBuilder::<Postgres>::new("INSERT INTO miners (uid, hotkey, github_id) ");
        builder.push_values(by_key.into_values(), |mut row, id| {
            row.push_bind(id.uid)
                .push_bind(id.hotkey)
                .push_bind(id.github_id);
        });
        builder.push(" ON CONFLICT (uid, hotkey, github_id) DO UPDATE SET updated_at = now()");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(DbError::from_write)?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: &MinerId) -> Result<Option<MinerRow>> {
        sqlx::query_as::<_, MinerRow>(
            r#"
            SELECT uid, hotkey, github_id, created_at, updated_at
            FROM miners
            WHERE uid = $1 AND hotkey = $2 AND github_id = $3
            "#,
        )
        .bind(id.uid)
        .bind(&id.hotkey)
        .bind(&id.github_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_by_uid(&self, uid: i32) -> Result<Vec<MinerRow>> {
        sqlx::query_as::<_, MinerRow>(
            r#"
            SELECT uid, hotkey, github_id, created_at, updated_at
            FROM miners
            WHERE uid = $1
            ORDER BY created_at
            "#,
        )
        .bind(uid)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_by_hotkey(&self, hotkey: &str) -> Result<Vec<MinerRow>> {
        sqlx::query_as::<_, MinerRow>(
            r#"
            SELECT uid, hotkey, github_id, created_at, updated_at
            FROM miners
            WHERE hotkey = $1
            ORDER BY created_at
            "#,
        )
        .bind(hotkey)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_by_github_id(&self, github_id: &str) -> Result<Vec<MinerRow>> {
        sqlx::query_as::<_, MinerRow>(
            r#"
            SELECT uid, hotkey, github_id, created_at, updated_at
            FROM miners
            WHERE github_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(github_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn get_by_hotkey_and_github_id(
        &self,
        hotkey: &str,
        github_id: &str,
    ) -> Result<Option<MinerRow>> {
        sqlx::query_as::<_, MinerRow>(
            r#"
            SELECT uid, hotkey, github_id, created_at, updated_at
            FROM miners
            WHERE hotkey = $1 AND github_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(hotkey)
        .bind(github_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list(&self) -> Result<Vec<MinerRow>> {
        sqlx::query_as::<_, MinerRow>(
            r#"
            SELECT uid, hotkey, github_id, created_at, updated_at
            FROM miners
            ORDER BY uid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    #[instrument(skip(self, id), fields(uid = id.uid))]
    async fn delete(&self, id: &MinerId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM miners
            WHERE uid = $1 AND hotkey = $2 AND github_id = $3
            "#,
        )
        .bind(id.uid)
        .bind(&id.hotkey)
        .bind(&id.github_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
struct PgPullRequestRepository {
    pool: PgPool,
}

#[async_trait]
impl PullRequestRepository for PgPullRequestRepository {
    #[instrument(
        skip(self, pr),
        fields(number = pr.number, repo = %pr.repository_full_name)
    )]
    async fn upsert(&self, pr: PullRequestUpsert) -> Result<()> {
        pr.miner.validate()?;
        // The conflict arm deliberately leaves the miner columns alone so a
        // re-crawl can never silently reattribute an existing pull request.
        sqlx::query(
            r#"
            INSERT INTO pull_requests (
                number, repository_full_name, uid, hotkey, miner_github_id,
                earned_score, title, merged_at, pr_created_at, additions,
                deletions, commits, author_login, merged_by_login
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (number, repository_full_name) DO UPDATE
                SET earned_score = EXCLUDED.earned_score,
                    title = EXCLUDED.title,
                    merged_at = EXCLUDED.merged_at,
                    pr_created_at = EXCLUDED.pr_created_at,
                    additions = EXCLUDED.additions,
                    deletions = EXCLUDED.deletions,
                    commits = EXCLUDED.commits,
                    author_login = EXCLUDED.author_login,
                    merged_by_login = EXCLUDED.merged_by_login,
                    updated_at = now()
            "#,
        )
        .bind(pr.number)
        .bind(pr.repository_full_name)
        .bind(pr.miner.uid)
        .bind(pr.miner.hotkey)
        .bind(pr.miner.github_id)
        .bind(pr.earned_score)
        .bind(pr.title)
        .bind(pr.merged_at)
        .bind(pr.pr_created_at)
        .bind(pr.additions)
        .bind(pr.deletions)
        .bind(pr.commits)
        .bind(pr.author_login)
        .bind(pr.merged_by_login)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(DbError::from_write)
    }

    #[instrument(skip(self, prs), fields(count = prs.len()))]
    async fn upsert_bulk(&self, prs: Vec<PullRequestUpsert>) -> Result<u64> {
        if prs.is_empty() {
            return Ok(0);
        }
        for pr in &prs {
            pr.miner.validate()?;
        }
        // A crawler batch can legitimately carry the same PR twice; collapse
        // by key since ON CONFLICT DO UPDATE cannot touch a row twice in one
        // statement. The last occurrence wins.
        let mut by_key: HashMap<(i64, String), PullRequestUpsert> = HashMap::new();
        for pr in prs {
            by_key.insert((pr.number, pr.repository_full_name.clone()), pr);
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO pull_requests (number, repository_full_name, uid, hotkey, \
             miner_github_id, earned_score, title, merged_at, pr_created_at, additions, \
             deletions, commits, author_login, merged_by_login) ",
        );
        builder.push_values(by_key.into_values(), |mut row, pr| {
            row.push_bind(pr.number)
                .push_bind(pr.repository_full_name)
                .push_bind(pr.miner.uid)
                .push_bind(pr.miner.hotkey)
                .push_bind(pr.miner.github_id)
                .push_bind(pr.earned_score)
                .push_bind(pr.title)
                .push_bind(pr.merged_at)
                .push_bind(pr.pr_created_at)
                .push_bind(pr.additions)
                .push_bind(pr.deletions)
                .push_bind(pr.commits)
                .push_bind(pr.author_login)
                .push_bind(pr.merged_by_login);
        });
        builder.push(
            " ON CONFLICT (number, repository_full_name) DO UPDATE \
             SET earned_score = EXCLUDED.earned_score, \
                 title = EXCLUDED.title, \
                 merged_at = EXCLUDED.merged_at, \
                 pr_created_at = EXCLUDED.pr_created_at, \
                 additions = EXCLUDED.additions, \
                 deletions = EXCLUDED.deletions, \
                 commits = EXCLUDED.commits, \
                 author_login = EXCLUDED.author_login, \
                 merged_by_login = EXCLUDED.merged_by_login, \
                 updated_at = now()",
        );

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(DbError::from_write)?;
        Ok(result.rows_affected())
    }

    async fn set_earned_score(
        &self,
        number: i64,
        repository_full_name: &str,
        earned_score: Decimal,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pull_requests
            SET earned_score = $3,
                updated_at = now()
            WHERE number = $1 AND repository_full_name = $2
            "#,
        )
        .bind(number)
        .bind(repository_full_name)
        .bind(earned_score)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_write)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(
        &self,
        number: i64,
        repository_full_name: &str,
    ) -> Result<Option<PullRequestRow>> {
        sqlx::query_as::<_, PullRequestRow>(
            r#"
            SELECT number, repository_full_name, uid, hotkey,
                   miner_github_id AS github_id, earned_score, title, merged_at,
                   pr_created_at, additions, deletions, commits, author_login,
                   merged_by_login, created_at, updated_at
            FROM pull_requests
            WHERE number = $1 AND repository_full_name = $2
            "#,
        )
        .bind(number)
        .bind(repository_full_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn get_with_file_changes(
        &self,
        number: i64,
        repository_full_name: &str,
    ) -> Result<Option<(PullRequestRow, Vec<FileChangeRow>)>> {
        // Repeatable read pins one snapshot for both statements, so a
        // cascade landing between them cannot strip the file changes out
        // from under their pull request.
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;

        let pr = sqlx::query_as::<_, PullRequestRow>(
            r#"
            SELECT number, repository_full_name, uid, hotkey,
                   miner_github_id AS github_id, earned_score, title, merged_at,
                   pr_created_at, additions, deletions, commits, author_login,
                   merged_by_login, created_at, updated_at
            FROM pull_requests
            WHERE number = $1 AND repository_full_name = $2
            "#,
        )
        .bind(number)
        .bind(repository_full_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        let Some(pr) = pr else {
            tx.commit().await.map_err(DbError::Query)?;
            return Ok(None);
        };

        let changes = sqlx::query_as::<_, FileChangeRow>(
            r#"
            SELECT id, pr_number, repository_full_name, filename, changes,
                   additions, deletions, status, file_extension, patch,
                   created_at, updated_at
            FROM file_changes
            WHERE pr_number = $1 AND repository_full_name = $2
            ORDER BY filename
            "#,
        )
        .bind(number)
        .bind(repository_full_name)
        .fetch_all(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        tx.commit().await.map_err(DbError::Query)?;
        Ok(Some((pr, changes)))
    }

    async fn list_by_repository(
        &self,
        repository_full_name: &str,
    ) -> Result<Vec<PullRequestRow>> {
        sqlx::query_as::<_, PullRequestRow>(
            r#"
            SELECT number, repository_full_name, uid, hotkey,
                   miner_github_id AS github_id, earned_score, title, merged_at,
                   pr_created_at, additions, deletions, commits, author_login,
                   merged_by_login, created_at, updated_at
            FROM pull_requests
            WHERE repository_full_name = $1
            ORDER BY merged_at DESC NULLS LAST, number
            "#,
        )
        .bind(repository_full_name)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_by_miner(&self, miner: &MinerId) -> Result<Vec<PullRequestRow>> {
        sqlx::query_as::<_, PullRequestRow>(
            r#"
            SELECT number, repository_full_name, uid, hotkey,
                   miner_github_id AS github_id, earned_score, title, merged_at,
                   pr_created_at, additions, deletions, commits, author_login,
                   merged_by_login, created_at, updated_at
            FROM pull_requests
            WHERE uid = $1 AND hotkey = $2 AND miner_github_id = $3
            ORDER BY earned_score DESC, merged_at DESC NULLS LAST
            "#,
        )
        .bind(miner.uid)
        .bind(&miner.hotkey)
        .bind(&miner.github_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}

#[derive(Clone)]
struct PgIssueRepository {
    pool: PgPool,
}

#[async_trait]
impl IssueRepository for PgIssueRepository {
    async fn upsert(&self, issue: IssueRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO issues (
                number, repository_full_name, pr_number, title, created_at, closed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (number, repository_full_name) DO UPDATE
                SET pr_number = EXCLUDED.pr_number,
                    title = EXCLUDED.title,
                    created_at = EXCLUDED.created_at,
                    closed_at = EXCLUDED.closed_at
            "#,
        )
        .bind(issue.number)
        .bind(issue.repository_full_name)
        .bind(issue.pr_number)
        .bind(issue.title)
        .bind(issue.created_at)
        .bind(issue.closed_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(DbError::from_write)
    }

    #[instrument(skip(self, issues), fields(count = issues.len()))]
    async fn upsert_bulk(&self, issues: Vec<IssueRow>) -> Result<u64> {
        if issues.is_empty() {
            return Ok(0);
        }
        let mut by_key: HashMap<(i64, String), IssueRow> = HashMap::new();
        for issue in issues {
            by_key.insert((issue.number, issue.repository_full_name.clone()), issue);
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO issues (number, repository_full_name, pr_number, title, \
             created_at, closed_at) ",
        );
        builder.push_values(by_key.into_values(), |mut row, issue| {
            row.push_bind(issue.number)
                .push_bind(issue.repository_full_name)
                .push_bind(issue.pr_number)
                .push_bind(issue.title)
                .push_bind(issue.created_at)
                .push_bind(issue.closed_at);
        });
        builder.push(
            " ON CONFLICT (number, repository_full_name) DO UPDATE \
             SET pr_number = EXCLUDED.pr_number, \
                 title = EXCLUDED.title, \
                 created_at = EXCLUDED.created_at, \
                 closed_at = EXCLUDED.closed_at",
        );

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(DbError::from_write)?;
        Ok(result.rows_affected())
    }

    async fn get(&self, number: i64, repository_full_name: &str) -> Result<Option<IssueRow>> {
        sqlx::query_as::<_, IssueRow>(
            r#"
            SELECT number, repository_full_name, pr_number, title, created_at, closed_at
            FROM issues
            WHERE number = $1 AND repository_full_name = $2
            "#,
        )
        .bind(number)
        .bind(repository_full_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_by_repository(&self, repository_full_name: &str) -> Result<Vec<IssueRow>> {
        sqlx::query_as::<_, IssueRow>(
            r#"
            SELECT number, repository_full_name, pr_number, title, created_at, closed_at
            FROM issues
            WHERE repository_full_name = $1
            ORDER BY created_at DESC NULLS LAST, number
            "#,
        )
        .bind(repository_full_name)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_by_pull_request(
        &self,
        pr_number: i64,
        repository_full_name: &str,
    ) -> Result<Vec<IssueRow>> {
        sqlx::query_as::<_, IssueRow>(
            r#"
            SELECT number, repository_full_name, pr_number, title, created_at, closed_at
            FROM issues
            WHERE pr_number = $1 AND repository_full_name = $2
            ORDER BY number
            "#,
        )
        .bind(pr_number)
        .bind(repository_full_name)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}

#[derive(Clone)]
struct PgFileChangeRepository {
    pool: PgPool,
}

#[async_trait]
impl FileChangeRepository for PgFileChangeRepository {
    #[instrument(
        skip(self, change),
        fields(pr_number = change.pr_number, filename = %change.filename)
    )]
    async fn upsert(&self, change: FileChangeUpsert) -> Result<()> {
        let file_extension = change.resolved_extension();
        sqlx::query(
            r#"
            INSERT INTO file_changes (
                pr_number, repository_full_name, filename, changes, additions,
                deletions, status, file_extension, patch
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (pr_number, repository_full_name, filename) DO UPDATE
                SET changes = EXCLUDED.changes,
                    additions = EXCLUDED.additions,
                    deletions = EXCLUDED.deletions,
                    status = EXCLUDED.status,
                    file_extension = EXCLUDED.file_extension,
                    patch = EXCLUDED.patch,
                    updated_at = now()
            "#,
        )
        .bind(change.pr_number)
        .bind(change.repository_full_name)
        .bind(change.filename)
        .bind(change.changes)
        .bind(change.additions)
        .bind(change.deletions)
        .bind(change.status)
        .bind(file_extension)
        .bind(change.patch)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(DbError::from_write)
    }

    #[instrument(skip(self, changes), fields(count = changes.len()))]
    async fn upsert_bulk(&self, changes: Vec<FileChangeUpsert>) -> Result<u64> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut by_key: HashMap<(i64, String, String), FileChangeUpsert> = HashMap::new();
        for change in changes {
            by_key.insert(
                (
                    change.pr_number,
                    change.repository_full_name.clone(),
                    change.filename.clone(),
                ),
                change,
            );
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO file_changes (pr_number, repository_full_name, filename, \
             changes, additions, deletions, status, file_extension, patch) ",
        );
        builder.push_values(by_key.into_values(), |mut row, change| {
            let file_extension = change.resolved_extension();
            row.push_bind(change.pr_number)
                .push_bind(change.repository_full_name)
                .push_bind(change.filename)
                .push_bind(change.changes)
                .push_bind(change.additions)
                .push_bind(change.deletions)
                .push_bind(change.status)
                .push_bind(file_extension)
                .push_bind(change.patch);
        });
        builder.push(
            " ON CONFLICT (pr_number, repository_full_name, filename) DO UPDATE \
             SET changes = EXCLUDED.changes, \
                 additions = EXCLUDED.additions, \
                 deletions = EXCLUDED.deletions, \
                 status = EXCLUDED.status, \
                 file_extension = EXCLUDED.file_extension, \
                 patch = EXCLUDED.patch, \
                 updated_at = now()",
        );

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(DbError::from_write)?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: i64) -> Result<Option<FileChangeRow>> {
        sqlx::query_as::<_, FileChangeRow>(
            r#"
            SELECT id, pr_number, repository_full_name, filename, changes,
                   additions, deletions, status, file_extension, patch,
                   created_at, updated_at
            FROM file_changes
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_by_pull_request(
        &self,
        pr_number: i64,
        repository_full_name: &str,
    ) -> Result<Vec<FileChangeRow>> {
        sqlx::query_as::<_, FileChangeRow>(
            r#"
            SELECT id, pr_number, repository_full_name, filename, changes,
                   additions, deletions, status, file_extension, patch,
                   created_at, updated_at
            FROM file_changes
            WHERE pr_number = $1 AND repository_full_name = $2
            ORDER BY filename
            "#,
        )
        .bind(pr_number)
        .bind(repository_full_name)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}

#[derive(Clone)]
struct PgMinerEvaluationRepository {
    pool: PgPool,
}

#[async_trait]
impl MinerEvaluationRepository for PgMinerEvaluationRepository {
    #[instrument(
        skip(self, evaluation),
        fields(uid = evaluation.miner.uid, failed = evaluation.failed_reason.is_some())
    )]
    async fn insert(&self, evaluation: MinerEvaluationInsert) -> Result<MinerEvaluationRow> {
        evaluation.miner.validate()?;

        // A failed run must not persist partial metrics.
        let metrics = if evaluation.failed_reason.is_some() {
            EvaluationMetrics::default()
        } else {
            evaluation.metrics
        };
        let MinerId {
            uid,
            hotkey,
            github_id,
        } = evaluation.miner;

        sqlx::query_as::<_, MinerEvaluationRow>(
            r#"
            INSERT INTO miner_evaluations (
                uid, hotkey, github_id, failed_reason, total_score,
                total_lines_changed, total_open_prs, total_prs,
                unique_repos_count, evaluation_timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, now()))
            RETURNING id, uid, hotkey, github_id, failed_reason, total_score,
                      total_lines_changed, total_open_prs, total_prs,
                      unique_repos_count, evaluation_timestamp, created_at
            "#,
        )
        .bind(uid)
        .bind(&hotkey)
        .bind(&github_id)
        .bind(evaluation.failed_reason)
        .bind(metrics.total_score)
        .bind(metrics.total_lines_changed)
        .bind(metrics.total_open_prs)
        .bind(metrics.total_prs)
        .bind(metrics.unique_repos_count)
        .bind(evaluation.evaluation_timestamp)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match DbError::from_write(err) {
            DbError::DuplicateKey { .. } => DbError::DuplicateEvaluation { uid, hotkey },
            other => other,
        })
    }

    async fn get(&self, id: i64) -> Result<Option<MinerEvaluationRow>> {
        sqlx::query_as::<_, MinerEvaluationRow>(
            r#"
            SELECT id, uid, hotkey, github_id, failed_reason, total_score,
                   total_lines_changed, total_open_prs, total_prs,
                   unique_repos_count, evaluation_timestamp, created_at
            FROM miner_evaluations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn latest(&self, uid: i32, hotkey: &str) -> Result<Option<MinerEvaluationRow>> {
        sqlx::query_as::<_, MinerEvaluationRow>(
            r#"
            SELECT id, uid, hotkey, github_id, failed_reason, total_score,
                   total_lines_changed, total_open_prs, total_prs,
                   unique_repos_count, evaluation_timestamp, created_at
            FROM miner_evaluations
            WHERE uid = $1 AND hotkey = $2
            ORDER BY evaluation_timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(uid)
        .bind(hotkey)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn latest_all(&self) -> Result<Vec<MinerEvaluationRow>> {
        sqlx::query_as::<_, MinerEvaluationRow>(
            r#"
            SELECT DISTINCT ON (uid, hotkey)
                   id, uid, hotkey, github_id, failed_reason, total_score,
                   total_lines_changed, total_open_prs, total_prs,
                   unique_repos_count, evaluation_timestamp, created_at
            FROM miner_evaluations
            ORDER BY uid, hotkey, evaluation_timestamp DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn list_by_timeframe(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MinerEvaluationRow>> {
        sqlx::query_as::<_, MinerEvaluationRow>(
            r#"
            SELECT id, uid, hotkey, github_id, failed_reason, total_score,
                   total_lines_changed, total_open_prs, total_prs,
                   unique_repos_count, evaluation_timestamp, created_at
            FROM miner_evaluations
            WHERE evaluation_timestamp BETWEEN $1 AND $2
            ORDER BY evaluation_timestamp DESC, total_score DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}
