/// Postgres SQLSTATE classes the write paths care about.
const FOREIGN_KEY_VIOLATION: &str = "23503";
const NOT_NULL_VIOLATION: &str = "23502";
const UNIQUE_VIOLATION: &str = "23505";
const CHECK_VIOLATION: &str = "23514";

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("query error: {0}")]
    Query(#[source] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    /// A write referenced a parent row that does not exist. The caller must
    /// create the parent (repository/miner/pull request) first.
    #[error("referential integrity violation ({constraint}): referenced parent row does not exist")]
    ReferentialIntegrity { constraint: String },
    /// A numeric invariant (non-negativity) or required column was violated.
    #[error("constraint violation ({constraint}): {message}")]
    ConstraintViolation { constraint: String, message: String },
    #[error("duplicate key ({constraint})")]
    DuplicateKey { constraint: String },
    /// An evaluation already exists for this (uid, hotkey) at this timestamp.
    #[error("duplicate evaluation for miner uid={uid} hotkey={hotkey}")]
    DuplicateEvaluation { uid: i32, hotkey: String },
    #[error("invalid miner identity: uid must be non-negative, got {uid}")]
    InvalidIdentity { uid: i32 },
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Classify a write-path failure by SQLSTATE so integrity errors surface
    /// as their own variants instead of opaque query errors.
    pub(crate) fn from_write(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let constraint = db_err.constraint().unwrap_or("unknown").to_owned();
            match db_err.code().as_deref() {
                Some(FOREIGN_KEY_VIOLATION) => {
                    return DbError::ReferentialIntegrity { constraint };
                }
                Some(CHECK_VIOLATION) | Some(NOT_NULL_VIOLATION) => {
                    return DbError::ConstraintViolation {
                        constraint,
                        message: db_err.message().to_owned(),
                    };
                }
                Some(UNIQUE_VIOLATION) => {
                    return DbError::DuplicateKey { constraint };
                }
                _ => {}
            }
        }
        DbError::Query(err)
    }
}
