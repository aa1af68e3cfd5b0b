use thiserror::Error;

/// Fatal errors while writing a cache file.
#[derive(Debug, Error)]
pub enum SaveError {
    /// A task, live opaque closure, or foreign-datatype instance reached
    /// the codec.
    #[error("cannot serialize {0}")]
    Unserializable(&'static str),

    /// A code instance carries a partial-opaque return constant and the
    /// caller disabled skipping.
    #[error("cannot serialize a code instance with a partial-opaque return type")]
    PartialOpaqueReturn,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors while restoring a cache file. Structural rejections leave the
/// runtime untouched.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("cache file not found: {0}")]
    NotFound(String),

    /// Magic, version, byte-order mark, pointer size, or environment
    /// identity did not match.
    #[error("cache header verification failed")]
    HeaderMismatch,

    /// The recorded loaded-module list disagrees with the session.
    #[error("module list mismatch: {0}")]
    ModuleListMismatch(String),

    /// A recorded include-dependency changed on disk.
    #[error("stale dependency: {0}")]
    StaleDependency(String),

    /// The stream ended early or carried an impossible tag.
    #[error("corrupt cache stream: {0}")]
    Corrupt(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RestoreError {
    /// Whether the load was rejected before any state was installed.
    pub fn is_structural_reject(&self) -> bool {
        matches!(
            self,
            RestoreError::HeaderMismatch
                | RestoreError::ModuleListMismatch(_)
                | RestoreError::StaleDependency(_)
        )
    }
}
