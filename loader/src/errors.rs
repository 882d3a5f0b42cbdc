use thiserror::Error;

/// Errors that can occur while reassembling a sharded checkpoint.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// IO error occurred (checkpoint files, vocab files, sink output)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration fault (missing checkpoint argument, vocab size mismatch,
    /// unsupported architecture selection)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Consistency fault (diverging consumed-sample counters, architecture
    /// incompatible with the expert layout, replica mismatch)
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// A tensor the schema requires is absent from a loaded shard
    #[error("Missing tensor '{path}' in shard {coordinate}")]
    MissingTensor { path: String, coordinate: String },

    /// Tensor shapes cannot be combined as requested
    #[error("Shape error: {0}")]
    Shape(String),

    /// The shard provider does not implement the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The hand-off channel closed before the stream finished
    #[error("Channel error: {0}")]
    Channel(String),

    /// The producer terminated the stream with an exit marker
    #[error("Stream aborted by producer: {0}")]
    Aborted(String),

    /// Loader invariant broken (e.g. a released shard group requested again)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

impl From<toml::de::Error> for LoaderError {
    fn from(e: toml::de::Error) -> Self {
        LoaderError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for LoaderError {
    fn from(e: toml::ser::Error) -> Self {
        LoaderError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for LoaderError {
    fn from(e: serde_json::Error) -> Self {
        LoaderError::Serialization(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for LoaderError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        LoaderError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for LoaderError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        LoaderError::Serialization(e.to_string())
    }
}
