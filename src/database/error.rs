use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DatabaseErrorKind {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("duplicate record: {message}")]
    UniqueViolation { message: String },

    /// Compare-and-set lost against a concurrent writer.
    #[error("version conflict on {id}: expected version {expected}")]
    VersionConflict { id: String, expected: i64 },

    #[error("connection error: {message}")]
    ConnectionError { message: String },

    #[error("database error: {message}")]
    Unknown { message: String },
}

#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity,
            id: id.to_string(),
        })
    }

    pub fn version_conflict(id: impl ToString, expected: i64) -> Self {
        Self::new(DatabaseErrorKind::VersionConflict {
            id: id.to_string(),
            expected,
        })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::NotFound { .. })
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::VersionConflict { .. })
    }

    /// Worth retrying after a short pause: lost races and dropped connections.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::VersionConflict { .. } | DatabaseErrorKind::ConnectionError { .. }
        )
    }

    #[cfg(feature = "database")]
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::new(DatabaseErrorKind::NotFound {
                entity: "row",
                id: String::new(),
            }),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::new(DatabaseErrorKind::ConnectionError {
                    message: err.to_string(),
                })
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::new(DatabaseErrorKind::UniqueViolation {
                    message: db.message().to_string(),
                })
            }
            _ => Self::new(DatabaseErrorKind::Unknown {
                message: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        let conflict = DatabaseError::version_conflict("abc", 3);
        assert!(conflict.is_version_conflict());
        assert!(conflict.is_retryable());
        assert!(!conflict.is_not_found());

        let missing = DatabaseError::not_found("transaction", "abc");
        assert!(missing.is_not_found());
        assert!(!missing.is_retryable());
        assert_eq!(missing.to_string(), "transaction not found: abc");
    }
}
