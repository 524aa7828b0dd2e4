//! `mod_access`: connection level access control.
//!
//! ```json
//! { "mod_access": { "Deny": ["10.0.0.1", "::1"], "MaxRequestsPerConnection": 100 } }
//! ```
//!
//! Peers in `Deny` are refused with `403 Forbidden` before anything is read.
//! With `MaxRequestsPerConnection` set, every connection gets a session that
//! answers `429 Too Many Requests` once the limit is passed.

use std::net::IpAddr;
use std::sync::Arc;

use bref_api::environment::Environment;
use bref_api::module::{API_VERSION, LoadContext, Module, ModuleInfo, Session, Version};
use bref_api::pipeline::{ConnectionHandler, ConnectionHook, PipelineBuilder, Priority};
use bref_api::protocol::{HttpRequest, HttpResponse, StatusCode, Value};
use bref_api::{Dispose, Owned, owned};
use tracing::{info, warn};

pub const NAME: &str = "mod_access";

static INFO: ModuleInfo = ModuleInfo {
    name: NAME,
    description: "peer deny list and per-connection request limit",
    version: Version::new(0, 1),
    minimum_api_version: API_VERSION,
};

pub fn load(ctx: &LoadContext<'_>) -> Owned<dyn Module> {
    let module = ctx.span.in_scope(|| ModAccess::from_config(ctx.config));
    owned!(module)
}

#[derive(Debug, Default)]
pub struct ModAccess {
    deny: Arc<Vec<IpAddr>>,
    max_requests: Option<u64>,
}

impl ModAccess {
    pub fn new(deny: Vec<IpAddr>, max_requests: Option<u64>) -> Self {
        Self { deny: Arc::new(deny), max_requests }
    }

    fn from_config(config: &Value) -> Self {
        let deny = config
            .get("Deny")
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| match entry.as_str().map(str::parse::<IpAddr>) {
                Some(Ok(addr)) => Some(addr),
                _ => {
                    warn!(entry = %entry, "ignoring invalid deny entry");
                    None
                }
            })
            .collect::<Vec<_>>();
        let max_requests = config.get("MaxRequestsPerConnection").as_int().and_then(|n| u64::try_from(n).ok());
        info!(denied = deny.len(), max_requests, "load module {NAME}");
        Self::new(deny, max_requests)
    }
}

impl Dispose for ModAccess {}

impl Module for ModAccess {
    fn info(&self) -> &ModuleInfo {
        &INFO
    }

    fn register_hooks(&self, pipeline: &mut PipelineBuilder) {
        if self.deny.is_empty() {
            return;
        }
        let deny = Arc::clone(&self.deny);
        let hook = ConnectionHook::new(move |env: &Environment| {
            if deny.contains(&env.client().addr.ip()) { ConnectionHandler::from_fn(refuse) } else { ConnectionHandler::empty() }
        });
        // access control runs before any other gate
        pipeline.connection_hooks.push(hook, Priority::HIGH);
    }

    fn open_session(&self, _env: &Environment) -> Option<Owned<dyn Session>> {
        let limit = self.max_requests?;
        Some(owned!(RequestLimit { served: 0, limit }))
    }
}

fn refuse(response: &mut HttpResponse, env: &Environment) -> bool {
    env.span().in_scope(|| info!(peer = %env.client().addr, "peer denied"));
    response.set_status(StatusCode::FORBIDDEN);
    false
}

#[derive(Debug)]
struct RequestLimit {
    served: u64,
    limit: u64,
}

impl Dispose for RequestLimit {}

impl Session for RequestLimit {
    fn on_request(&mut self, _request: &HttpRequest, response: &mut HttpResponse) {
        self.served += 1;
        if self.served > self.limit {
            warn!(served = self.served, limit = self.limit, "request limit reached");
            response.set_status(StatusCode::TOO_MANY_REQUESTS);
        }
    }
}
