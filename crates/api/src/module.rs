//! The module contract: identity, version negotiation and hook registration.
//!
//! A module is loaded once at server start. The host checks that the API the
//! module was built against is compatible with its own, then hands the module
//! a [`PipelineBuilder`](crate::pipeline::PipelineBuilder) so it can register
//! hooks. Modules may also open a [`Session`] per connection to observe the
//! requests served on it.

use std::fmt;

use thiserror::Error;
use tracing::Span;

use crate::config::ConfHelper;
use crate::dispose::{Dispose, Owned};
use crate::environment::Environment;
use crate::pipeline::PipelineBuilder;
use crate::protocol::{HttpRequest, HttpResponse, Value};

/// The API version this crate provides.
pub const API_VERSION: Version = Version::new(0, 3);

/// A `major.minor` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

/// Result of comparing a module's required API version with the host's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    /// Majors match but minors differ: loadable, worth a warning.
    MinorMismatch,
    /// Majors differ: the module must not be loaded.
    Incompatible,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Checks a module requiring `self` against a host providing `provided`.
    pub fn compatibility(self, provided: Version) -> Compatibility {
        if self.major != provided.major {
            Compatibility::Incompatible
        } else if self.minor != provided.minor {
            Compatibility::MinorMismatch
        } else {
            Compatibility::Compatible
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Identity of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub version: Version,
    pub minimum_api_version: Version,
}

/// A server extension.
pub trait Module: Dispose + Send + Sync {
    fn info(&self) -> &ModuleInfo;

    /// Adds this module's hooks to the pipeline. Called exactly once.
    fn register_hooks(&self, pipeline: &mut PipelineBuilder);

    /// Opens per-connection state, if the module keeps any.
    fn open_session(&self, _env: &Environment) -> Option<Owned<dyn Session>> {
        None
    }
}

/// Per-connection module state, disposed when the connection ends.
pub trait Session: Dispose + Send {
    /// Observes a parsed request before post-parsing hooks run.
    ///
    /// Setting an error status here stops the request before content selection.
    fn on_request(&mut self, _request: &HttpRequest, _response: &mut HttpResponse) {}
}

/// What a module constructor may see while it is created.
#[derive(Clone, Copy)]
pub struct LoadContext<'a> {
    pub span: &'a Span,
    pub config: &'a Value,
    pub conf: &'a dyn ConfHelper,
}

impl fmt::Debug for LoadContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadContext").field("span", self.span).finish_non_exhaustive()
    }
}

/// Module constructor.
pub type LoadFn = fn(&LoadContext<'_>) -> Owned<dyn Module>;

/// Errors raised while loading a module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("module {name} requires api version {required}, server provides {provided}")]
    IncompatibleVersion { name: &'static str, required: Version, provided: Version },

    #[error("module {name} is already loaded")]
    Duplicate { name: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility() {
        let provided = Version::new(1, 2);
        assert_eq!(Version::new(1, 2).compatibility(provided), Compatibility::Compatible);
        assert_eq!(Version::new(1, 0).compatibility(provided), Compatibility::MinorMismatch);
        assert_eq!(Version::new(1, 5).compatibility(provided), Compatibility::MinorMismatch);
        assert_eq!(Version::new(2, 0).compatibility(provided), Compatibility::Incompatible);
        assert_eq!(Version::new(0, 2).compatibility(provided), Compatibility::Incompatible);
    }

    #[test]
    fn test_display() {
        assert_eq!(API_VERSION.to_string(), "0.3");
    }
}
