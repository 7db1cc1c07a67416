//! Error taxonomy (§7). The phase driver catches only the two variants that
//! are specified as recoverable; everything else aborts the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid geometry: {context}")]
    InvalidGeometry { context: String },

    #[error("loader error on feature {feature}: {reason}")]
    Loader { feature: String, reason: String },

    #[error("pipeline invariant violated: {0}")]
    Invariant(String),

    #[error("external service {service} failed: {reason}")]
    External { service: String, reason: String },
}

impl ClusterError {
    /// Per §7: the phase driver catches only these two; the rest abort.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClusterError::Storage(StorageError::Transient(_))
                | ClusterError::InvalidGeometry { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        if is_transient_sql_error(&e) {
            StorageError::Transient(e.to_string())
        } else {
            StorageError::Constraint(e.to_string())
        }
    }
}

/// Deadlocks (40P01), serialization failures (40001) and connection resets
/// are transient; everything else is a hard storage failure.
fn is_transient_sql_error(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        if let Some(code) = db_err.code() {
            return code == "40P01" || code == "40001" || code == "08006" || code == "08003";
        }
    }
    matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
}
