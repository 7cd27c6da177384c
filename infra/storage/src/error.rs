use std::borrow::Cow;
use std::path::Path;

/// A specialized [`StorageError`] enum of this crate.
#[regstore_derive::regstore_error]
pub enum StorageError {
    /// The target name is already taken (`create`, upload start).
    #[error("File already exists{}: {message}", format_context(.context))]
    AlreadyExists { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The target name does not exist (`update`, `read`, `unlink`, lock acquisition).
    #[error("File not found{}: {message}", format_context(.context))]
    FileNotFound { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Path traversal security violation{}: {message}", format_context(.context))]
    PathTraversalAttempt { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// Every lock attempt found the lock busy. Carries the error of the final attempt.
    #[error("Lock still busy after {attempts} attempts{}: {last_error}", format_context(.context))]
    LockTimeout { attempts: u32, last_error: std::io::Error, context: Option<Cow<'static, str>> },

    /// An operation was invoked in a state that does not allow it.
    #[error("Invalid state{}: {message}", format_context(.context))]
    InvalidState { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Hardware I/O failure{}: {source}", format_context(.context))]
    Io { source: std::io::Error, context: Option<Cow<'static, str>> },

    #[error("JSON failure{}: {source}", format_context(.context))]
    Json { source: serde_json::Error, context: Option<Cow<'static, str>> },

    #[error("Internal storage error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

impl StorageError {
    pub(crate) fn already_exists(path: &Path) -> Self {
        Self::AlreadyExists { message: path.display().to_string().into(), context: None }
    }

    pub(crate) fn not_found(path: &Path) -> Self {
        Self::FileNotFound { message: path.display().to_string().into(), context: None }
    }

    pub(crate) fn invalid_state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidState { message: message.into(), context: None }
    }

    /// Maps an I/O error on `path`, turning `NotFound` into [`StorageError::FileNotFound`].
    pub(crate) fn from_io(err: std::io::Error, path: &Path, action: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::not_found(path);
        }
        Self::Io { source: err, context: Some(format!("{action}: {}", path.display()).into()) }
    }
}
