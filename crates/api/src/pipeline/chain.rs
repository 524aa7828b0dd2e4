//! Composition of transform handlers.
//!
//! Every handler of a chain sees the output of the one before it. Handlers
//! are never called with an empty input in the middle of a stream; an empty
//! input is reserved for the end-of-stream signal, delivered to each handler
//! in order right after its pending data.

use bytes::BytesMut;

use crate::protocol::HttpResponse;

use super::hooks::TransformHandler;
use super::{PipelineError, Stage};

/// Transform handlers of one stage, in priority order.
#[derive(Debug, Clone)]
pub struct TransformChain {
    stage: Stage,
    handlers: Vec<TransformHandler>,
}

impl TransformChain {
    pub fn new(stage: Stage) -> Self {
        Self { stage, handlers: Vec::new() }
    }

    pub(crate) fn push(&mut self, handler: TransformHandler) {
        self.handlers.push(handler);
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// An empty chain passes data through unchanged.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs `input` through every handler.
    ///
    /// # Errors
    ///
    /// Never fails for chains built by a pipeline, which only holds non-empty
    /// handlers; kept fallible so a stray empty handler surfaces as an error.
    pub fn process(&self, response: &mut HttpResponse, input: &[u8]) -> Result<BytesMut, PipelineError> {
        self.run(response, input, false)
    }

    /// Runs the last `input` through every handler, then signals end of stream.
    ///
    /// # Errors
    ///
    /// See [`TransformChain::process`].
    pub fn finish(&self, response: &mut HttpResponse, input: &[u8]) -> Result<BytesMut, PipelineError> {
        self.run(response, input, true)
    }

    fn run(&self, response: &mut HttpResponse, input: &[u8], end_of_stream: bool) -> Result<BytesMut, PipelineError> {
        let mut current = BytesMut::from(input);
        for handler in &self.handlers {
            let mut output = BytesMut::new();
            if !current.is_empty() {
                self.call(handler, response, &current, &mut output)?;
            }
            if end_of_stream {
                self.call(handler, response, &[], &mut output)?;
            }
            current = output;
        }
        Ok(current)
    }

    fn call(
        &self,
        handler: &TransformHandler,
        response: &mut HttpResponse,
        input: &[u8],
        output: &mut BytesMut,
    ) -> Result<(), PipelineError> {
        handler.call((response, input, output)).map_err(|_| PipelineError::empty_call(self.stage))
    }
}

/// The three downstream stages a response body flows through, in order:
/// post-content, transform, pre-send.
#[derive(Debug, Clone)]
pub struct Downstream {
    chains: [TransformChain; 3],
}

impl Downstream {
    pub(crate) fn new(post_content: TransformChain, transform: TransformChain, pre_send: TransformChain) -> Self {
        Self { chains: [post_content, transform, pre_send] }
    }

    pub fn is_empty(&self) -> bool {
        self.chains.iter().all(TransformChain::is_empty)
    }

    /// Runs a body chunk through all three stages.
    ///
    /// # Errors
    ///
    /// Propagates [`TransformChain::process`] errors.
    pub fn process(&self, response: &mut HttpResponse, input: &[u8]) -> Result<BytesMut, PipelineError> {
        let mut current = BytesMut::from(input);
        for chain in &self.chains {
            if current.is_empty() {
                break;
            }
            current = chain.process(response, &current)?;
        }
        Ok(current)
    }

    /// Flushes all three stages at end of body.
    ///
    /// # Errors
    ///
    /// Propagates [`TransformChain::finish`] errors.
    pub fn finish(&self, response: &mut HttpResponse) -> Result<BytesMut, PipelineError> {
        let mut current = BytesMut::new();
        for chain in &self.chains {
            current = chain.finish(response, &current)?;
        }
        Ok(current)
    }
}
