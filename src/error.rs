/// A `Result` whose error type is this crate's [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported by the pool and primary allocators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying allocator could not satisfy a request and no
    /// out-of-memory handler was installed to make progress.
    #[error("out of memory while allocating {size} bytes")]
    OutOfMemory {
        /// The size of the request that could not be satisfied.
        size: usize,
    },

    /// A requested size is too large to be described by a `Layout`.
    #[error("requested size overflows the maximum allocation size")]
    SizeOverflow,

    /// A configuration value was rejected.
    #[error("config error: {0}")]
    InvalidConfig(String),

    /// The background thread that drains deferred frees could not be started.
    #[error("failed to spawn the deferred-free drainer thread")]
    SpawnDrainer(#[source] std::io::Error),
}

impl Error {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        Error::InvalidConfig(msg.into())
    }
}
