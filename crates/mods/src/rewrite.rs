//! `mod_rewrite`: swaps URI suffixes before content selection.
//!
//! Rules come from the module's `Rules` map, suffix to replacement:
//!
//! ```json
//! { "mod_rewrite": { "Rules": { ".html": ".php", ".htm": ".php" } } }
//! ```
//!
//! Without rules, `.html` is rewritten to `.php`. Only the path is touched,
//! the query string is kept as is. When several suffixes match, the longest
//! one wins.

use std::sync::Arc;

use bref_api::environment::Environment;
use bref_api::module::{API_VERSION, LoadContext, Module, ModuleInfo, Version};
use bref_api::pipeline::{PipelineBuilder, PostParsingHook, Priority, TransformHandler};
use bref_api::protocol::{HttpRequest, HttpResponse, Value};
use bref_api::{Dispose, Owned, owned};
use tracing::{debug, warn};

pub const NAME: &str = "mod_rewrite";

static INFO: ModuleInfo = ModuleInfo {
    name: NAME,
    description: "a simple URL-rewrite module",
    version: Version::new(0, 2),
    minimum_api_version: API_VERSION,
};

pub fn load(ctx: &LoadContext<'_>) -> Owned<dyn Module> {
    let rules = ctx.span.in_scope(|| {
        let rules = Rules::from_config(ctx.config);
        debug!(rules = rules.0.len(), "loading URL rewrite module");
        rules
    });
    owned!(ModRewrite { rules: Arc::new(rules) })
}

#[derive(Debug)]
pub struct ModRewrite {
    rules: Arc<Rules>,
}

impl ModRewrite {
    pub fn new(rules: Rules) -> Self {
        Self { rules: Arc::new(rules) }
    }
}

impl Dispose for ModRewrite {}

impl Module for ModRewrite {
    fn info(&self) -> &ModuleInfo {
        &INFO
    }

    fn register_hooks(&self, pipeline: &mut PipelineBuilder) {
        pipeline.post_parsing_hooks.push(PostParsingHook::bind(Arc::clone(&self.rules), Rules::rewrite), Priority::NORMAL);
    }
}

/// Suffix replacement rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rules(Vec<(String, String)>);

impl Default for Rules {
    fn default() -> Self {
        Self(vec![(".html".to_owned(), ".php".to_owned())])
    }
}

impl Rules {
    pub fn new(rules: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut rules: Vec<_> = rules.into_iter().filter(|(from, _)| !from.is_empty()).collect();
        rules.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        Self(rules)
    }

    fn from_config(config: &Value) -> Self {
        let Some(map) = config.get("Rules").as_map() else {
            return Self::default();
        };
        let rules = map.iter().filter_map(|(from, to)| match to.as_str() {
            Some(to) => Some((from.clone(), to.to_owned())),
            None => {
                warn!(suffix = from.as_str(), "ignoring rewrite rule without a string replacement");
                None
            }
        });
        Self::new(rules)
    }

    /// Returns the rewritten form of `path`, if a rule matches.
    fn apply(&self, path: &str) -> Option<String> {
        self.0
            .iter()
            .find(|(from, _)| path.ends_with(from.as_str()))
            .map(|(from, to)| format!("{}{to}", &path[..path.len() - from.len()]))
    }

    fn rewrite(&self, _env: &Environment, request: &mut HttpRequest, _response: &mut HttpResponse) -> TransformHandler {
        if let Some(path) = self.apply(request.path()) {
            let uri = match request.query() {
                Some(query) => format!("{path}?{query}"),
                None => path,
            };
            debug!(from = request.uri(), to = uri.as_str(), "rewriting request uri");
            request.set_uri(uri);
        }
        // the body is of no interest
        TransformHandler::empty()
    }
}
