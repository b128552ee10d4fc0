//! Central error handling for the clipmap streaming core
//!
//! `ClipmapError` covers construction, configuration and I/O failures.
//! Tile sources report `SourceError`; load tasks fold those into their
//! terminal state instead of propagating them to the update thread.

/// Failure reported by a terrain or texture source while answering a request
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("tile request interrupted")]
    Interrupted,

    #[error("tile data not ready yet")]
    NotReady,

    #[error("tile not found: level={level}, x={x}, y={y}")]
    TileNotFound { level: u32, x: i32, y: i32 },

    #[error("source failure: {0}")]
    Failed(String),
}

impl SourceError {
    pub fn failed<T: ToString>(msg: T) -> Self {
        SourceError::Failed(msg.to_string())
    }

    pub fn not_found(level: u32, x: i32, y: i32) -> Self {
        SourceError::TileNotFound { level, x, y }
    }
}

/// Centralized error type for clipmap construction and configuration
#[derive(thiserror::Error, Debug)]
pub enum ClipmapError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClipmapError {
    /// Short category label used in log lines
    pub fn category(&self) -> &'static str {
        match self {
            ClipmapError::Configuration(_) => "Configuration",
            ClipmapError::Source(_) => "Source",
            ClipmapError::Io(_) => "IO",
            ClipmapError::Json(_) => "JSON",
        }
    }

    pub fn configuration<T: ToString>(msg: T) -> Self {
        ClipmapError::Configuration(msg.to_string())
    }

    pub fn io<T: ToString>(msg: T) -> Self {
        ClipmapError::Io(std::io::Error::other(msg.to_string()))
    }
}

/// Result type alias for clipmap operations
pub type ClipmapResult<T> = Result<T, ClipmapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_display() {
        let err = SourceError::not_found(3, -2, 7);
        assert_eq!(err.to_string(), "tile not found: level=3, x=-2, y=7");
        assert_eq!(SourceError::failed("disk").to_string(), "source failure: disk");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ClipmapError::configuration("bad").category(), "Configuration");
        assert_eq!(ClipmapError::from(SourceError::NotReady).category(), "Source");
        assert_eq!(ClipmapError::io("closed").category(), "IO");
        let json = serde_json::from_str::<u32>("nope").unwrap_err();
        assert_eq!(ClipmapError::from(json).category(), "JSON");
    }
}
