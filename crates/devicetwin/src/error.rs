//! Error taxonomy for the DeviceTwin reconciler.
//!
//! Grounded on `viaduct::error::Error` and, further up the teacher
//! workspace, `spark-switch::error::SwitchError`: a flat `thiserror` enum
//! with one variant per failure class named in spec §7
//! (`not_found`, `conflict`, `storage`, `validation`). `DeviceStore`
//! implementations wrap a `sqlx::Error` with [`Error::storage`] at the
//! point it occurs, so the context string stays meaningful.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A device (or device attribute) looked up by id does not exist.
    #[error("{context}: device `{id}` not found")]
    NotFound { context: &'static str, id: String },

    /// A caller attempted an operation the current state forbids, e.g. a
    /// second `Lock` on a device id already held by the caller's own task.
    #[error("conflict during {context}: {reason}")]
    Conflict { context: &'static str, reason: String },

    /// The persistence layer failed (connection, statement, transaction).
    #[error("storage error during {context}: {source}")]
    Storage {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Input failed validation (malformed content, unknown column, ...).
    #[error("validation error during {context}: {reason}")]
    Validation { context: &'static str, reason: String },
}

impl Error {
    pub fn not_found(context: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            context,
            id: id.into(),
        }
    }

    pub fn conflict(context: &'static str, reason: impl Into<String>) -> Self {
        Error::Conflict {
            context,
            reason: reason.into(),
        }
    }

    pub fn storage(context: &'static str, source: sqlx::Error) -> Self {
        Error::Storage { context, source }
    }

    pub fn validation(context: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            context,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
