use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bref_api::config::{ConfHelper, ServerConfig};
use bref_api::connection::HttpConnection;
use bref_api::environment::{Client, Environment};
use bref_api::module::Module;
use bref_api::pipeline::{Pipeline, PipelineBuilder, PreSendHook, Priority};
use bref_api::Owned;
use tokio::net::TcpListener;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::FmtSubscriber;

use crate::config::Settings;
use crate::date;
use crate::error::ServerError;
use crate::registry::Registry;

pub struct ServerBuilder {
    conf: ServerConfig,
    registry: Registry,
    modules: Vec<Owned<dyn Module>>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self { conf: ServerConfig::default(), registry: Registry::builtin(), modules: Vec::new() }
    }

    pub fn config(mut self, conf: ServerConfig) -> Self {
        self.conf = conf;
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Loads an already constructed module after the configured ones.
    pub fn module(mut self, module: Owned<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    /// Loads the modules and freezes the pipeline.
    ///
    /// # Errors
    ///
    /// Fails on invalid server settings or when a hook is invalid. Modules
    /// that can't be loaded are skipped.
    pub fn build(self) -> Result<Server, ServerError> {
        let settings = Settings::from_value(self.conf.root())?;
        let mut builder = PipelineBuilder::new();

        self.registry.load_all(&settings.modules, &self.conf, &mut builder);
        for module in self.modules {
            let name = module.info().name;
            if let Err(e) = builder.load_module(module) {
                error!(module = name, cause = %e, "module not loaded");
            }
        }
        if settings.date_header {
            builder.pre_send_hooks.push(PreSendHook::from_fn(date::insert_date), Priority::LOW);
        }

        let pipeline = builder.freeze()?;
        info!(modules = ?pipeline.module_names().collect::<Vec<_>>(), "pipeline ready");
        let conf: Arc<ServerConfig> = Arc::new(self.conf);
        Ok(Server { settings, conf, pipeline: Arc::new(pipeline), next_id: AtomicU64::new(1) })
    }
}

/// The bref server: accepts TCP connections and serves each of them through
/// the pipeline on its own task.
pub struct Server {
    settings: Settings,
    conf: Arc<dyn ConfHelper>,
    pipeline: Arc<Pipeline>,
    next_id: AtomicU64,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Installs the log subscriber, binds the configured address and serves
    /// until the process ends.
    ///
    /// # Errors
    ///
    /// Fails when the listening address can't be bound.
    pub async fn start(self) -> Result<(), ServerError> {
        let subscriber = FmtSubscriber::builder().with_max_level(self.settings.log_level).finish();
        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            warn!(cause = %e, "log subscriber already installed");
        }

        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Binds the configured `Listen` address.
    ///
    /// # Errors
    ///
    /// Fails when the address can't be resolved or bound.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let address = self.settings.listen.as_str();
        let listener = TcpListener::bind(address).await.map_err(|e| ServerError::bind(address, e))?;
        info!("start listening at {:?}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accepts connections on `listener` forever.
    ///
    /// # Errors
    ///
    /// Accept failures are logged and retried, so this only returns on
    /// cancellation.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (tcp_stream, remote_addr) = match listener.accept().await {
                Ok(stream_and_addr) => stream_and_addr,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let span = info_span!("connection", id, peer = %remote_addr);
            let env = Environment::new(Arc::clone(&self.conf), span.clone(), Client::new(id, remote_addr));
            let pipeline = Arc::clone(&self.pipeline);

            tokio::spawn(
                async move {
                    let (reader, writer) = tcp_stream.into_split();
                    let connection = HttpConnection::new(reader, writer, pipeline, env);
                    match connection.process().await {
                        Ok(()) => debug!("finished process, connection shutdown"),
                        Err(e) => error!(cause = %e, "service has error, connection shutdown"),
                    }
                }
                .instrument(span),
            );
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("settings", &self.settings).finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder").field("registry", &self.registry).finish_non_exhaustive()
    }
}
