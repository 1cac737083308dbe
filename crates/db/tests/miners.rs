use db::pg::PgDatabase;
use db::{DbError, MinerId, PullRequestUpsert, Repositories, RepositoryUpsert};
use db_test_fixture::DbFixture;
use rust_decimal::Decimal;
use sqlx::query_scalar;

fn sample_pr(number: i64, repo: &str, miner: &MinerId) -> PullRequestUpsert {
    PullRequestUpsert {
        number,
        repository_full_name: repo.into(),
        miner: miner.clone(),
        title: format!("PR {number}"),
        author_login: "alice".into(),
        pr_created_at: chrono::Utc::now(),
        merged_at: None,
        merged_by_login: None,
        earned_score: Decimal::ZERO,
        additions: 10,
        deletions: 2,
        commits: 1,
    }
}

#[tokio::test]
async fn negative_uid_is_rejected_before_the_database() -> anyhow::Result<()> {
    let fixture = match DbFixture::from_env() {
        Ok(f) => f,
        Err(err) => {
            eprintln!("skipping negative_uid_is_rejected_before_the_database: {err}");
            return Ok(());
        }
    };
    let handle = fixture.create("miners_uid").await?;
    let db = PgDatabase::from_pool(handle.pool().clone());

    let err = db
        .miners()
        .upsert(MinerId::new(-3, "hk1", "gh42"))
        .await
        .expect_err("negative uid must fail");
    assert!(matches!(err, DbError::InvalidIdentity { uid: -3 }));

    let count: i64 = query_scalar("SELECT COUNT(*) FROM miners")
        .fetch_one(handle.pool())
        .await?;
    assert_eq!(count, 0, "no row for an invalid identity");

    drop(db);
    handle.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn triple_upsert_is_idempotent() -> anyhow::Result<()> {
    let fixture = match DbFixture::from_env() {
        Ok(f) => f,
        Err(err) => {
            eprintln!("skipping triple_upsert_is_idempotent: {err}");
            return Ok(());
        }
    };
    let handle = fixture.create("miners_dedup").await?;
    let db = PgDatabase::from_pool(handle.pool().clone());

    let miner = MinerId::new(7, "hk1", "gh42");
    db.miners().upsert(miner.clone()).await?;
    db.miners().upsert(miner.clone()).await?;

    let count: i64 = query_scalar("SELECT COUNT(*) FROM miners WHERE uid = $1")
        .bind(7_i32)
        .fetch_one(handle.pool())
        .await?;
    assert_eq!(count, 1, "one row after repeated identical upserts");

    let fetched = db.miners().get(&miner).await?.expect("miner stored");
    assert_eq!(fetched.id, miner);

    drop(db);
    handle.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn bulk_registration_collapses_duplicate_triples() -> anyhow::Result<()> {
    let fixture = match DbFixture::from_env() {
        Ok(f) => f,
        Err(err) => {
            eprintln!("skipping bulk_registration_collapses_duplicate_triples: {err}");
            return Ok(());
        }
    };
    let handle = fixture.create("miners_bulk").await?;
    let db = PgDatabase::from_pool(handle.pool().clone());

    let first = MinerId::new(7, "hk1", "gh42");
    let second = MinerId::new(8, "hk2", "gh43");
    let written = db
        .miners()
        .upsert_bulk(vec![first.clone(), second.clone(), first.clone()])
        .await?;
    assert_eq!(written, 2, "repeated triple collapses to one row");

    let count: i64 = query_scalar("SELECT COUNT(*) FROM miners")
        .fetch_one(handle.pool())
        .await?;
    assert_eq!(count, 2);

    let err = db
        .miners()
        .upsert_bulk(vec![second, MinerId::new(-1, "hk3", "gh44")])
        .await
        .expect_err("invalid identity fails the whole batch");
    assert!(matches!(err, DbError::InvalidIdentity { uid: -1 }));

    assert_eq!(db.miners().upsert_bulk(Vec::new()).await?, 0);

    drop(db);
    handle.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn lookups_by_platform_account() -> anyhow::Result<()> {
    let fixture = match DbFixture::from_env() {
        Ok(f) => f,
        Err(err) => {
            eprintln!("skipping lookups_by_platform_account: {err}");
            return Ok(());
        }
    };
    let handle = fixture.create("miners_lookup").await?;
    let db = PgDatabase::from_pool(handle.pool().clone());

    // One platform account seen under two slots, plus an unrelated miner.
    db.miners().upsert(MinerId::new(7, "hk1", "gh42")).await?;
    db.miners().upsert(MinerId::new(9, "hk1", "gh42")).await?;
    db.miners().upsert(MinerId::new(8, "hk2", "gh43")).await?;

    let by_account = db.miners().list_by_github_id("gh42").await?;
    assert_eq!(by_account.len(), 2);
    assert!(by_account.iter().all(|m| m.id.github_id == "gh42"));

    let by_hotkey = db.miners().list_by_hotkey("hk1").await?;
    assert_eq!(by_hotkey.len(), 2);
    assert!(by_hotkey.iter().all(|m| m.id.hotkey == "hk1"));

    let newest = db
        .miners()
        .get_by_hotkey_and_github_id("hk1", "gh42")
        .await?
        .expect("pair registered");
    assert_eq!(newest.id.hotkey, "hk1");
    assert!(db
        .miners()
        .get_by_hotkey_and_github_id("hk1", "gh99")
        .await?
        .is_none());

    drop(db);
    handle.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn key_rotation_appends_a_new_triple() -> anyhow::Result<()> {
    let fixture = match DbFixture::from_env() {
        Ok(f) => f,
        Err(err) => {
            eprintln!("skipping key_rotation_appends_a_new_triple: {err}");
            return Ok(());
        }
    };
    let handle = fixture.create("miners_rotation").await?;
    let db = PgDatabase::from_pool(handle.pool().clone());

    let old_identity = MinerId::new(7, "hk1", "gh42");
    let new_identity = MinerId::new(7, "hk2", "gh42");

    db.repos()
        .upsert(RepositoryUpsert::from_full_name("acme/widgets").unwrap())
        .await?;
    db.miners().upsert(old_identity.clone()).await?;
    db.pull_requests()
        .upsert(sample_pr(1, "acme/widgets", &old_identity))
        .await?;

    // Rotation: the new triple is a fresh row, the old one stays.
    db.miners().upsert(new_identity.clone()).await?;
    let history = db.miners().list_by_uid(7).await?;
    assert_eq!(history.len(), 2);

    // Historical attribution stays with the triple that earned it.
    let old_prs = db.pull_requests().list_by_miner(&old_identity).await?;
    assert_eq!(old_prs.len(), 1);
    let new_prs = db.pull_requests().list_by_miner(&new_identity).await?;
    assert!(new_prs.is_empty());

    drop(db);
    handle.cleanup().await?;
    Ok(())
}
