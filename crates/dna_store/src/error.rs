use thiserror::Error;

use crate::models::MessageState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Illegal state transition {from:?} → {to:?}")]
    IllegalTransition {
        from: MessageState,
        to: MessageState,
    },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Invalid row data: {0}")]
    Corrupt(String),
}
