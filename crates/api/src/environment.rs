//! Per-connection context handed to every hook.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::Span;

use crate::config::ConfHelper;
use crate::protocol::Value;

/// The remote peer of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Client {
    /// Server-assigned connection id, unique for the lifetime of the process.
    pub id: u64,
    pub addr: SocketAddr,
}

impl Client {
    pub fn new(id: u64, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// What a hook may see about the server and the connection it runs for.
///
/// The span is the connection's tracing span: events logged while it is
/// entered carry the connection id and peer address. Hooks that spawn work of
/// their own should instrument it with [`Environment::span`].
#[derive(Clone)]
pub struct Environment {
    conf: Arc<dyn ConfHelper>,
    span: Span,
    client: Client,
}

impl Environment {
    pub fn new(conf: Arc<dyn ConfHelper>, span: Span, client: Client) -> Self {
        Self { conf, span, client }
    }

    /// The server configuration tree.
    pub fn config(&self) -> &Value {
        self.conf.root()
    }

    pub fn conf(&self) -> &dyn ConfHelper {
        &*self.conf
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment").field("client", &self.client).field("span", &self.span).finish_non_exhaustive()
    }
}
