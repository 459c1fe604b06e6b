//! Storage error mapping into the core taxonomy.

use aula_core::errors::{DatabaseError, Error};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] diesel::result::ConnectionError),

    #[error("Migration error: {0}")]
    Migration(String),
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Pool(e) => Error::Database(DatabaseError::Pool(e.to_string())),
            StorageError::Query(e) => Error::Database(DatabaseError::Query(e.to_string())),
            StorageError::Connection(e) => Error::Database(DatabaseError::Pool(e.to_string())),
            StorageError::Migration(e) => Error::Database(DatabaseError::Migration(e)),
        }
    }
}
