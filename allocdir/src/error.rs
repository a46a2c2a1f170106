use std::io;
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AllocDirError>;

/// Errors returned by allocation directory operations.
///
/// The two security variants render only the caller-supplied path. They never
/// include the allocation root, so their message is safe to hand back to a
/// remote caller verbatim.
#[derive(Debug, thiserror::Error)]
pub enum AllocDirError {
    #[error("Path {path:?} escapes the allocation directory")]
    EscapesSandbox { path: String },

    #[error("Reading secret file prohibited: {path:?}")]
    SecretAccessProhibited { path: String },

    #[error("Mounting the shared allocation directory is not supported on {platform}")]
    MountUnsupported { platform: &'static str },

    #[error("Task directory not found for task {task:?}")]
    TaskDirNotFound { task: String },

    #[error("Path {path:?} not found in the allocation directory")]
    NotFound { path: String },

    #[error("Invalid task name {name:?}: {reason}")]
    InvalidTaskName { name: String, reason: &'static str },

    #[error("Invalid archive entry {name:?}: {reason}")]
    InvalidArchiveEntry { name: String, reason: &'static str },

    #[error("Destination {path:?} already exists")]
    AlreadyExists { path: PathBuf },

    #[error("Allocation directory has been destroyed")]
    Destroyed,

    #[error("Failed to {op} '{}': {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("File watch failed: {0}")]
    Watch(#[from] notify::Error),
}

impl AllocDirError {
    /// Build an `Io` error carrying the failed operation and path.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        AllocDirError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// True for rejections a remote caller must only ever see as "bad request".
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            AllocDirError::EscapesSandbox { .. } | AllocDirError::SecretAccessProhibited { .. }
        )
    }

    /// True when the error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            AllocDirError::NotFound { .. } => true,
            AllocDirError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Attach an operation name and path to a raw `io::Result`.
pub(crate) trait IoContext<T> {
    fn io_context(self, op: &'static str, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, op: &'static str, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| AllocDirError::io(op, path, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_message_mentions_escapes_only_caller_path() {
        let err = AllocDirError::EscapesSandbox {
            path: "../foo".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("escapes"));
        assert!(msg.contains("../foo"));
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_secret_message() {
        let err = AllocDirError::SecretAccessProhibited {
            path: "web/secrets/token".to_string(),
        };
        assert!(err.to_string().contains("secret file prohibited"));
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_io_context_keeps_op_and_path() {
        let raw: io::Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let err = raw.io_context("stat", "/alloc/web").unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_security_violation());
        let msg = err.to_string();
        assert!(msg.contains("stat"));
        assert!(msg.contains("/alloc/web"));
    }
}
