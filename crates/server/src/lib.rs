//! The bref reference server.
//!
//! Reads a JSON configuration, loads the configured modules into a pipeline
//! and serves HTTP connections with it on tokio.
//!
//! ```no_run
//! use bref_api::config::ServerConfig;
//! use bref_server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conf = ServerConfig::from_json(r#"{ "Listen": "127.0.0.1:3000", "Modules": ["mod_http", "mod_hello"] }"#)?;
//!     Server::builder().config(conf).build()?.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod date;
pub mod registry;

mod error;
mod server;

pub use error::ServerError;
pub use registry::Registry;
pub use server::{Server, ServerBuilder};
