//! Modules bundled with bref.
//!
//! Each module lives in its own file and exposes a `load` constructor with
//! the [`LoadFn`] shape, so the server can load it by name from
//! [`BUILTIN`]:
//!
//! | name | stage | what it does |
//! |---|---|---|
//! | `mod_http` | parsing | HTTP/1.x request head parser |
//! | `mod_access` | connection | deny list and per-connection request limit |
//! | `mod_rewrite` | post-parsing | rewrites URI suffixes |
//! | `mod_cgi` | content | runs scripts as CGI processes |
//! | `mod_hello` | content | answers `Hello World !` |
//! | `mod_deflate` | transform | compresses response bodies |

use bref_api::module::LoadFn;

pub mod access;
#[cfg(unix)]
pub mod cgi;
pub mod deflate;
pub mod hello;
pub mod http;
pub mod rewrite;

/// Every bundled module, by name.
pub const BUILTIN: &[(&str, LoadFn)] = &[
    (http::NAME, http::load),
    (access::NAME, access::load),
    (rewrite::NAME, rewrite::load),
    #[cfg(unix)]
    (cgi::NAME, cgi::load),
    (hello::NAME, hello::load),
    (deflate::NAME, deflate::load),
];

/// Finds a bundled module constructor by name.
pub fn find(name: &str) -> Option<LoadFn> {
    BUILTIN.iter().find(|(builtin, _)| *builtin == name).map(|(_, load)| *load)
}
