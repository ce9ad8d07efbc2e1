#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("reactor error: {0}")]
    Reactor(#[from] nix::Error),

    #[error("channel {0} is closed")]
    ChannelClosed(crate::ChannelId),

    #[error("loop {0} is shut down and no longer accepts tasks")]
    LoopShutdown(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("handler fault: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary handler-side failure so it can be returned from a pipeline hook.
    pub fn handler(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Handler(err.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("requested {requested} bytes but only {available} are available")]
    OutOfBounds { requested: usize, available: usize },

    #[error("slice of {length} bytes at {index} is outside the written region (writer index {writer_index})")]
    InvalidSlice { index: usize, length: usize, writer_index: usize },

    #[error("index {index} is outside {lower}..={upper}")]
    InvalidIndex { index: usize, lower: usize, upper: usize },

    #[error("buffer has been released")]
    Released,

    #[error("buffer was released more times than it was retained")]
    ReleasedTooOften,

    #[error("buffer region is shared with a retained handle and cannot be written")]
    Shared,
}
