//! Model layer errors.

use thiserror::Error;

use crate::db::DatabaseError;
use crate::storage::StorageError;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    /// the handle's backing entity was deleted
    #[error("invalid instance: {0}")]
    InvalidInstance(String),

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("duplicate property '{property}' on class '{class}'")]
    DuplicateProperty { class: String, property: String },

    #[error("class '{0}' is already registered")]
    DuplicateClass(String),

    #[error("invalid value {value:?} for property '{property}' of class '{class}'")]
    InvalidPropertyValue {
        class: String,
        property: String,
        value: String,
    },

    #[error("broken link in '{property}': {path:?}")]
    BrokenLink { property: String, path: String },

    #[error("class '{class}' has no property '{property}'")]
    UnknownProperty { class: String, property: String },

    #[error("unknown class '{0}'")]
    UnknownClass(String),

    #[error("expected an instance of '{expected}', got '{found}'")]
    ClassMismatch { expected: String, found: String },

    #[error("cannot decode property '{property}' value {value:?} as {expected}")]
    Decode {
        property: String,
        value: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Database(Box<DatabaseError>),
}

impl From<DatabaseError> for ModelError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Model(inner) => inner,
            other => ModelError::Database(Box::new(other)),
        }
    }
}

impl From<StorageError> for ModelError {
    fn from(err: StorageError) -> Self {
        ModelError::Database(Box::new(DatabaseError::Storage(err)))
    }
}

impl ModelError {
    /// true for `Closed` coming up from the connection
    pub fn is_closed(&self) -> bool {
        matches!(self, ModelError::Database(inner) if matches!(**inner, DatabaseError::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_database_error() {
        let original = ModelError::DuplicateClass("widget".into());
        let wrapped: DatabaseError = original.into();
        let back: ModelError = wrapped.into();
        assert!(matches!(back, ModelError::DuplicateClass(ref c) if c == "widget"));
    }

    #[test]
    fn test_closed_detection() {
        let err: ModelError = DatabaseError::Closed.into();
        assert!(err.is_closed());
        assert!(!ModelError::UnknownClass("x".into()).is_closed());
    }
}
