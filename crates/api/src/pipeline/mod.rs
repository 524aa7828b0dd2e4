//! The hook pipeline.
//!
//! Modules register hooks per [`Stage`] on a [`PipelineBuilder`]. Once every
//! module is loaded the builder is frozen into an immutable [`Pipeline`], with
//! each stage's hooks sorted by descending [`Priority`]. Registration order
//! breaks ties.
//!
//! Stages fall into four phases that decide how their hooks are combined:
//!
//! | phase        | stages                                   | combination |
//! |--------------|------------------------------------------|-------------|
//! | gate         | connection, on-receive, on-send           | every handler must accept |
//! | upstream     | post-receive, parsing, post-parsing       | chains; parsing picks one |
//! | bridge       | content                                  | first hook to answer wins |
//! | downstream   | post-content, transform, pre-send         | chains |
//!
//! The traversal rules live in [`traverse`].

use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

use crate::dispose::Owned;
use crate::function::{Function, Signature};
use crate::module::{API_VERSION, Compatibility, LoadError, Module, Version};
use crate::utils::ensure;

mod chain;
pub use chain::Downstream;
pub use chain::TransformChain;

pub mod hooks;
pub use hooks::*;

pub mod traverse;

/// A point of the request lifecycle where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connection,
    OnReceive,
    OnSend,
    PostReceive,
    Parsing,
    PostParsing,
    Content,
    PostContent,
    Transform,
    PreSend,
}

/// How a stage combines its hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Gate,
    Upstream,
    Bridge,
    Downstream,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Connection,
        Stage::OnReceive,
        Stage::OnSend,
        Stage::PostReceive,
        Stage::Parsing,
        Stage::PostParsing,
        Stage::Content,
        Stage::PostContent,
        Stage::Transform,
        Stage::PreSend,
    ];

    pub fn phase(self) -> Phase {
        match self {
            Stage::Connection | Stage::OnReceive | Stage::OnSend => Phase::Gate,
            Stage::PostReceive | Stage::Parsing | Stage::PostParsing => Phase::Upstream,
            Stage::Content => Phase::Bridge,
            Stage::PostContent | Stage::Transform | Stage::PreSend => Phase::Downstream,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Connection => "connection",
            Stage::OnReceive => "on-receive",
            Stage::OnSend => "on-send",
            Stage::PostReceive => "post-receive",
            Stage::Parsing => "parsing",
            Stage::PostParsing => "post-parsing",
            Stage::Content => "content",
            Stage::PostContent => "post-content",
            Stage::Transform => "transform",
            Stage::PreSend => "pre-send",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hook ordering weight. Higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Priority(pub f32);

impl Priority {
    pub const LOW: Priority = Priority(0.0);
    pub const NORMAL: Priority = Priority(0.5);
    pub const HIGH: Priority = Priority(1.0);

    pub fn value(self) -> f32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<f32> for Priority {
    fn from(value: f32) -> Self {
        Self(value)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("empty hook registered at {stage} #{index}")]
    EmptyHook { stage: Stage, index: usize },

    #[error("hook at {stage} #{index} has invalid priority {priority}")]
    InvalidPriority { stage: Stage, index: usize, priority: f32 },

    #[error("call to empty Function object in {stage} stage")]
    EmptyCall { stage: Stage },
}

impl PipelineError {
    pub fn empty_call(stage: Stage) -> Self {
        Self::EmptyCall { stage }
    }
}

/// A hook together with its priority.
pub struct HookEntry<S: Signature> {
    pub hook: Function<S>,
    pub priority: Priority,
}

impl<S: Signature> fmt::Debug for HookEntry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEntry").field("hook", &self.hook).field("priority", &self.priority).finish()
    }
}

/// The hooks registered for one stage.
pub struct HookList<S: Signature> {
    entries: Vec<HookEntry<S>>,
}

impl<S: Signature> HookList<S> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, hook: Function<S>, priority: impl Into<Priority>) {
        self.entries.push(HookEntry { hook, priority: priority.into() });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HookEntry<S>> {
        self.entries.iter()
    }

    /// Validates the hooks and sorts them by descending priority.
    fn freeze(&mut self, stage: Stage) -> Result<(), PipelineError> {
        for (index, entry) in self.entries.iter().enumerate() {
            ensure!(!entry.hook.is_empty(), PipelineError::EmptyHook { stage, index });
            let priority = entry.priority.value();
            ensure!(!priority.is_nan(), PipelineError::InvalidPriority { stage, index, priority });
        }
        // stable, so equal priorities keep registration order
        self.entries.sort_by(|a, b| b.priority.value().total_cmp(&a.priority.value()));
        Ok(())
    }
}

impl<S: Signature> Default for HookList<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Signature> fmt::Debug for HookList<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.entries).finish()
    }
}

/// Mutable pipeline filled in by modules while they load.
#[derive(Debug)]
pub struct PipelineBuilder {
    pub connection_hooks: HookList<ConnectionHookSig>,
    pub on_receive_hooks: HookList<OnReceiveHookSig>,
    pub on_send_hooks: HookList<OnSendHookSig>,
    pub post_receive_hooks: HookList<PostReceiveHookSig>,
    pub parsing_hooks: HookList<ParsingHookSig>,
    pub post_parsing_hooks: HookList<PostParsingHookSig>,
    pub content_hooks: HookList<ContentHookSig>,
    pub post_content_hooks: HookList<DownstreamHookSig>,
    pub transform_hooks: HookList<DownstreamHookSig>,
    pub pre_send_hooks: HookList<DownstreamHookSig>,
    api_version: Version,
    modules: Vec<Owned<dyn Module>>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::with_api_version(API_VERSION)
    }

    /// Creates a builder advertising `api_version` to loading modules.
    pub fn with_api_version(api_version: Version) -> Self {
        Self {
            connection_hooks: HookList::new(),
            on_receive_hooks: HookList::new(),
            on_send_hooks: HookList::new(),
            post_receive_hooks: HookList::new(),
            parsing_hooks: HookList::new(),
            post_parsing_hooks: HookList::new(),
            content_hooks: HookList::new(),
            post_content_hooks: HookList::new(),
            transform_hooks: HookList::new(),
            pre_send_hooks: HookList::new(),
            api_version,
            modules: Vec::new(),
        }
    }

    pub fn api_version(&self) -> Version {
        self.api_version
    }

    /// Number of hooks registered for `stage`.
    pub fn stage_len(&self, stage: Stage) -> usize {
        match stage {
            Stage::Connection => self.connection_hooks.len(),
            Stage::OnReceive => self.on_receive_hooks.len(),
            Stage::OnSend => self.on_send_hooks.len(),
            Stage::PostReceive => self.post_receive_hooks.len(),
            Stage::Parsing => self.parsing_hooks.len(),
            Stage::PostParsing => self.post_parsing_hooks.len(),
            Stage::Content => self.content_hooks.len(),
            Stage::PostContent => self.post_content_hooks.len(),
            Stage::Transform => self.transform_hooks.len(),
            Stage::PreSend => self.pre_send_hooks.len(),
        }
    }

    /// Total number of hooks over all stages.
    pub fn hook_count(&self) -> usize {
        Stage::ALL.iter().map(|&stage| self.stage_len(stage)).sum()
    }

    /// Checks a module's version, lets it register its hooks and keeps it.
    ///
    /// # Errors
    ///
    /// An incompatible or duplicate module is disposed without registering
    /// anything and reported as a [`LoadError`].
    pub fn load_module(&mut self, module: Owned<dyn Module>) -> Result<(), LoadError> {
        let module_info = module.info().clone();
        let provided = self.api_version;

        match module_info.minimum_api_version.compatibility(provided) {
            Compatibility::Compatible => {}
            Compatibility::MinorMismatch => {
                warn!(
                    module = module_info.name,
                    required = %module_info.minimum_api_version,
                    provided = %provided,
                    "module api minor version differs, loading anyway"
                );
            }
            Compatibility::Incompatible => {
                return Err(LoadError::IncompatibleVersion {
                    name: module_info.name,
                    required: module_info.minimum_api_version,
                    provided,
                });
            }
        }
        let name = module_info.name;
        ensure!(self.modules.iter().all(|m| m.info().name != name), LoadError::Duplicate { name });

        let before = self.hook_count();
        module.register_hooks(self);
        info!(module = name, version = %module_info.version, hooks = self.hook_count() - before, "module loaded");

        self.modules.push(module);
        Ok(())
    }

    /// Validates and sorts every stage.
    ///
    /// # Errors
    ///
    /// Fails on the first empty hook or NaN priority.
    pub fn freeze(mut self) -> Result<Pipeline, PipelineError> {
        self.connection_hooks.freeze(Stage::Connection)?;
        self.on_receive_hooks.freeze(Stage::OnReceive)?;
        self.on_send_hooks.freeze(Stage::OnSend)?;
        self.post_receive_hooks.freeze(Stage::PostReceive)?;
        self.parsing_hooks.freeze(Stage::Parsing)?;
        self.post_parsing_hooks.freeze(Stage::PostParsing)?;
        self.content_hooks.freeze(Stage::Content)?;
        self.post_content_hooks.freeze(Stage::PostContent)?;
        self.transform_hooks.freeze(Stage::Transform)?;
        self.pre_send_hooks.freeze(Stage::PreSend)?;

        Ok(Pipeline {
            connection_hooks: self.connection_hooks,
            on_receive_hooks: self.on_receive_hooks,
            on_send_hooks: self.on_send_hooks,
            post_receive_hooks: self.post_receive_hooks,
            parsing_hooks: self.parsing_hooks,
            post_parsing_hooks: self.post_parsing_hooks,
            content_hooks: self.content_hooks,
            post_content_hooks: self.post_content_hooks,
            transform_hooks: self.transform_hooks,
            pre_send_hooks: self.pre_send_hooks,
            modules: self.modules,
        })
    }
}

/// Frozen pipeline shared by every connection.
///
/// Hooks are dropped before the modules that registered them are disposed.
#[derive(Debug)]
pub struct Pipeline {
    connection_hooks: HookList<ConnectionHookSig>,
    on_receive_hooks: HookList<OnReceiveHookSig>,
    on_send_hooks: HookList<OnSendHookSig>,
    post_receive_hooks: HookList<PostReceiveHookSig>,
    parsing_hooks: HookList<ParsingHookSig>,
    post_parsing_hooks: HookList<PostParsingHookSig>,
    content_hooks: HookList<ContentHookSig>,
    post_content_hooks: HookList<DownstreamHookSig>,
    transform_hooks: HookList<DownstreamHookSig>,
    pre_send_hooks: HookList<DownstreamHookSig>,
    modules: Vec<Owned<dyn Module>>,
}

impl Pipeline {
    /// Names of the loaded modules, in load order.
    pub fn module_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.iter().map(|m| m.info().name)
    }

    pub fn modules(&self) -> &[Owned<dyn Module>] {
        &self.modules
    }

    /// Priorities of a stage's hooks in traversal order.
    pub fn priorities(&self, stage: Stage) -> Vec<Priority> {
        fn collect<S: Signature>(list: &HookList<S>) -> Vec<Priority> {
            list.iter().map(|entry| entry.priority).collect()
        }
        match stage {
            Stage::Connection => collect(&self.connection_hooks),
            Stage::OnReceive => collect(&self.on_receive_hooks),
            Stage::OnSend => collect(&self.on_send_hooks),
            Stage::PostReceive => collect(&self.post_receive_hooks),
            Stage::Parsing => collect(&self.parsing_hooks),
            Stage::PostParsing => collect(&self.post_parsing_hooks),
            Stage::Content => collect(&self.content_hooks),
            Stage::PostContent => collect(&self.post_content_hooks),
            Stage::Transform => collect(&self.transform_hooks),
            Stage::PreSend => collect(&self.pre_send_hooks),
        }
    }
}
