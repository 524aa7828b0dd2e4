use std::io;

use thiserror::Error;

use crate::content::ContentError;
use crate::pipeline::PipelineError;

/// Errors that end a connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("pipeline error: {source}")]
    Pipeline {
        #[from]
        source: PipelineError,
    },

    #[error("content error: {source}")]
    Content {
        #[from]
        source: ContentError,
    },
}

impl ConnectionError {
    /// Whether the peer can still be sent an error response.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io { .. })
    }
}
