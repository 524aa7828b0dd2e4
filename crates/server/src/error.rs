use std::io;

use bref_api::pipeline::PipelineError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("invalid pipeline: {source}")]
    Pipeline {
        #[from]
        source: PipelineError,
    },

    #[error("can't listen on {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ServerError {
    pub fn bind<S: ToString>(address: S, source: io::Error) -> Self {
        Self::Bind { address: address.to_string(), source }
    }
}
