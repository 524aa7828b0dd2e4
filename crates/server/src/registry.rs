//! Module lookup and loading.
//!
//! Modules are linked into the server and found by name in a [`Registry`].
//! Loading one runs its constructor with a [`LoadContext`] and hands the
//! result to the pipeline builder, which checks the API version before the
//! module registers any hook. A module that can't be loaded is logged and
//! skipped; the server starts with the others.

use std::collections::BTreeMap;

use bref_api::config::ConfHelper;
use bref_api::module::{LoadContext, LoadFn, LoadError};
use bref_api::pipeline::PipelineBuilder;
use thiserror::Error;
use tracing::{error, info, info_span};

use crate::config::ModuleEntry;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown module {name}")]
    Unknown { name: String },

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Module constructors by name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    modules: BTreeMap<String, LoadFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every module bundled with bref.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for (name, load) in bref_mods::BUILTIN {
            registry.register(*name, *load);
        }
        registry
    }

    /// Adds or replaces a constructor.
    pub fn register(&mut self, name: impl Into<String>, load: LoadFn) {
        self.modules.insert(name.into(), load);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Constructs the module named by `entry` and loads it into `builder`.
    ///
    /// # Errors
    ///
    /// Fails for unknown names and for modules the builder rejects.
    pub fn load(&self, entry: &ModuleEntry, conf: &dyn ConfHelper, builder: &mut PipelineBuilder) -> Result<(), RegistryError> {
        let name = entry.name();
        let load = self.modules.get(name).ok_or_else(|| RegistryError::Unknown { name: name.to_owned() })?;
        let span = info_span!("module", name);
        let config = entry.config(conf);
        let ctx = LoadContext { span: &span, config: &config, conf };
        let module = load(&ctx);
        builder.load_module(module)?;
        Ok(())
    }

    /// Loads every entry in order, skipping the ones that fail. Returns the
    /// number of modules loaded.
    pub fn load_all(&self, entries: &[ModuleEntry], conf: &dyn ConfHelper, builder: &mut PipelineBuilder) -> usize {
        let mut loaded = 0;
        for entry in entries {
            match self.load(entry, conf, builder) {
                Ok(()) => loaded += 1,
                Err(e) => error!(module = entry.name(), cause = %e, "module not loaded"),
            }
        }
        info!(loaded, requested = entries.len(), "modules loaded");
        loaded
    }
}
