//! How the host walks each stage of a frozen [`Pipeline`].
//!
//! - gate stages ask every hook for a handler and stop at the first handler
//!   that refuses; hooks answering with an empty handler abstain
//! - post-receive, post-parsing and the downstream stages collect every
//!   non-empty handler into a [`TransformChain`]
//! - parsing picks the first hook that answers with a handler
//! - content picks the first hook that returns a content handler, and stops
//!   early when a hook declines by setting an error status
//!
//! Hooks are visited in priority order, so a higher priority hook that takes
//! a request hides the ones after it.

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::content::{ContentStream, ReadinessSource};
use crate::environment::Environment;
use crate::function::{Function, Signature};
use crate::dispose::Owned;
use crate::module::Session;
use crate::protocol::{HttpRequest, HttpResponse};

use super::chain::{Downstream, TransformChain};
use super::hooks::{DownstreamHookSig, ParsingHandler};
use super::{HookList, Pipeline, PipelineError, Stage};

#[inline]
fn call<'a, S: Signature>(stage: Stage, f: &Function<S>, args: S::Args<'a>) -> Result<S::Output, PipelineError> {
    f.call(args).map_err(|_| PipelineError::empty_call(stage))
}

impl Pipeline {
    /// Asks the connection gate whether to serve a new connection.
    ///
    /// A refusing handler may set a status on `response` to be sent back.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyCall`] if a hook slot holds no target.
    pub fn accept_connection(&self, response: &mut HttpResponse, env: &Environment) -> Result<bool, PipelineError> {
        for entry in self.connection_hooks.iter() {
            let handler = call(Stage::Connection, &entry.hook, (env,))?;
            if handler.is_empty() {
                continue;
            }
            if !call(Stage::Connection, &handler, (&mut *response, env))? {
                debug!(priority = entry.priority.value(), "connection refused by gate");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs the on-receive gate over freshly read bytes. Handlers may edit
    /// the buffer in place.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyCall`] if a hook slot holds no target.
    pub fn accept_received(&self, env: &Environment, buffer: &mut BytesMut) -> Result<bool, PipelineError> {
        for entry in self.on_receive_hooks.iter() {
            let handler = call(Stage::OnReceive, &entry.hook, (env,))?;
            if handler.is_empty() {
                continue;
            }
            if !call(Stage::OnReceive, &handler, (env.client(), &mut *buffer))? {
                debug!(len = buffer.len(), "received data refused by gate");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs the on-send gate over bytes about to be written.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyCall`] if a hook slot holds no target.
    pub fn accept_send(&self, env: &Environment, data: &[u8]) -> Result<bool, PipelineError> {
        for entry in self.on_send_hooks.iter() {
            let handler = call(Stage::OnSend, &entry.hook, (env,))?;
            if handler.is_empty() {
                continue;
            }
            if !call(Stage::OnSend, &handler, (env.client(), data))? {
                debug!(len = data.len(), "outgoing data refused by gate");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Builds the chain that raw received bytes go through before parsing.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyCall`] if a hook slot holds no target.
    pub fn post_receive_chain(&self, env: &Environment) -> Result<TransformChain, PipelineError> {
        let mut chain = TransformChain::new(Stage::PostReceive);
        for entry in self.post_receive_hooks.iter() {
            let handler = call(Stage::PostReceive, &entry.hook, (env,))?;
            if !handler.is_empty() {
                chain.push(handler);
            }
        }
        Ok(chain)
    }

    /// Picks the parser for the next request: the first hook that answers.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyCall`] if a hook slot holds no target.
    pub fn select_parser(&self, env: &Environment) -> Result<Option<ParsingHandler>, PipelineError> {
        for entry in self.parsing_hooks.iter() {
            let handler = call(Stage::Parsing, &entry.hook, (env,))?;
            if !handler.is_empty() {
                trace!(priority = entry.priority.value(), "parser selected");
                return Ok(Some(handler));
            }
        }
        Ok(None)
    }

    /// Lets post-parsing hooks rewrite the request and collects their body
    /// transforms.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyCall`] if a hook slot holds no target.
    pub fn post_parsing_chain(
        &self,
        env: &Environment,
        request: &mut HttpRequest,
        response: &mut HttpResponse,
    ) -> Result<TransformChain, PipelineError> {
        let mut chain = TransformChain::new(Stage::PostParsing);
        for entry in self.post_parsing_hooks.iter() {
            let handler = call(Stage::PostParsing, &entry.hook, (env, &mut *request, &mut *response))?;
            if !handler.is_empty() {
                chain.push(handler);
            }
        }
        Ok(chain)
    }

    /// Finds the content handler for a request.
    ///
    /// Hooks are asked in priority order and the first handler wins; hooks
    /// after it are never asked. A hook that declines and leaves an error
    /// status on the response ends the search.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyCall`] if a hook slot holds no target.
    pub fn select_content(
        &self,
        env: &Environment,
        request: &HttpRequest,
        response: &mut HttpResponse,
    ) -> Result<Option<ContentStream>, PipelineError> {
        for entry in self.content_hooks.iter() {
            let mut source = ReadinessSource::None;
            let handler = call(Stage::Content, &entry.hook, (env, request, &mut *response, &mut source))?;
            if let Some(handler) = handler {
                debug!(priority = entry.priority.value(), ?source, "content handler selected");
                return Ok(Some(ContentStream::new(handler, source)));
            }
            if response.is_error() {
                debug!(status = ?response.status(), "content hook declined with error status");
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Builds the post-content, transform and pre-send chains for a response.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyCall`] if a hook slot holds no target.
    pub fn downstream(
        &self,
        env: &Environment,
        request: &HttpRequest,
        response: &mut HttpResponse,
    ) -> Result<Downstream, PipelineError> {
        let build = |stage: Stage,
                     hooks: &HookList<DownstreamHookSig>,
                     response: &mut HttpResponse|
         -> Result<TransformChain, PipelineError> {
            let mut chain = TransformChain::new(stage);
            for entry in hooks.iter() {
                let handler = call(stage, &entry.hook, (env, request, &mut *response))?;
                if !handler.is_empty() {
                    chain.push(handler);
                }
            }
            Ok(chain)
        };

        let post_content = build(Stage::PostContent, &self.post_content_hooks, response)?;
        let transform = build(Stage::Transform, &self.transform_hooks, response)?;
        let pre_send = build(Stage::PreSend, &self.pre_send_hooks, response)?;
        Ok(Downstream::new(post_content, transform, pre_send))
    }

    /// Opens every loaded module's session for a new connection.
    pub fn open_sessions(&self, env: &Environment) -> Vec<Owned<dyn Session>> {
        self.modules.iter().filter_map(|module| module.open_session(env)).collect()
    }
}
