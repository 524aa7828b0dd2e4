//! The bref module API.
//!
//! bref is a modular HTTP server. The server itself only accepts connections
//! and moves bytes around; everything else is done by modules that hook into
//! a fixed pipeline of stages. This crate is the contract between the two:
//! it defines the stages and their hook signatures, the objects hooks work
//! on, and the host-side driver that walks a connection through them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bref_api::content::ContentHandler;
//! use bref_api::module::{API_VERSION, Module, ModuleInfo, Version};
//! use bref_api::pipeline::{ContentHook, PipelineBuilder, Priority};
//! use bref_api::protocol::{HttpResponse, StatusCode};
//! use bref_api::{Dispose, owned};
//! use bytes::BytesMut;
//!
//! struct Hello;
//!
//! impl Dispose for Hello {}
//!
//! impl ContentHandler for Hello {
//!     fn in_content(&mut self, _response: &mut HttpResponse, _chunk: &[u8]) -> bool {
//!         true
//!     }
//!
//!     fn out_content(&mut self, response: &mut HttpResponse, output: &mut BytesMut) -> bool {
//!         response.set_status(StatusCode::OK);
//!         output.extend_from_slice(b"hi");
//!         true
//!     }
//! }
//!
//! struct HelloModule(ModuleInfo);
//!
//! impl Dispose for HelloModule {}
//!
//! impl Module for HelloModule {
//!     fn info(&self) -> &ModuleInfo {
//!         &self.0
//!     }
//!
//!     fn register_hooks(&self, pipeline: &mut PipelineBuilder) {
//!         pipeline.content_hooks.push(ContentHook::new(|_, _, _, _| Some(owned!(Hello))), Priority::LOW);
//!     }
//! }
//!
//! let mut builder = PipelineBuilder::new();
//! let info = ModuleInfo { name: "hello", description: "", version: Version::new(1, 0), minimum_api_version: API_VERSION };
//! builder.load_module(owned!(HelloModule(info))).unwrap();
//! let pipeline = Arc::new(builder.freeze().unwrap());
//! ```
//!
//! # Architecture
//!
//! - [`function`]: copyable callables used for every hook and handler
//! - [`protocol`]: requests, responses and configuration values
//! - [`config`]: configuration lookup with virtual host overrides
//! - [`environment`]: per-connection context given to hooks
//! - [`module`]: module identity, versioning and sessions
//! - [`pipeline`]: stages, hook registration and traversal
//! - [`content`]: content handlers and their lifecycle
//! - [`connection`]: the connection driver
//!
//! # Limitations
//!
//! - HTTP/1.0 and HTTP/1.1 only
//! - Request bodies need a `Content-Length`
//! - Responses are buffered before they are sent

pub mod config;
pub mod connection;
pub mod content;
pub mod dispose;
pub mod environment;
pub mod function;
pub mod module;
pub mod pipeline;
pub mod protocol;

mod utils;

pub use dispose::{Dispose, Owned};
