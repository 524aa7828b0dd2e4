//! Server settings.
//!
//! The whole configuration is one JSON document. Modules read their own keys
//! from it through [`ConfHelper`](bref_api::config::ConfHelper); the server
//! itself only looks at:
//!
//! | key | default | meaning |
//! |---|---|---|
//! | `Listen` | `127.0.0.1:8080` | address to accept connections on |
//! | `Modules` | `["mod_http", "mod_hello"]` | modules to load, in order |
//! | `LogLevel` | `info` | maximum level of log events |
//! | `DateHeader` | `true` | add a `Date` header to every response |
//!
//! A `Modules` entry is either a name, whose settings are then read from the
//! top-level key of the same name, or an object with a `name` and the
//! module's settings inline:
//!
//! ```json
//! {
//!     "Modules": ["mod_http", { "name": "mod_rewrite", "Rules": { ".htm": ".html" } }],
//!     "mod_http": { "MaxHeadBytes": 16384 }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bref_api::config::{ConfHelper, ServerConfig};
use bref_api::protocol::Value;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::Level;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_MODULES: &[&str] = &["mod_http", "mod_hello"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("can't read {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },

    #[error("invalid configuration: {source}")]
    Parse {
        #[from]
        source: serde_json::Error,
    },
}

/// One module to load.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ModuleEntry {
    /// A module configured by the top-level key of the same name.
    Name(String),
    /// A module with its settings inline.
    Inline {
        name: String,
        #[serde(flatten)]
        settings: BTreeMap<String, Value>,
    },
}

impl ModuleEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Inline { name, .. } => name,
        }
    }

    /// The settings handed to the module when it is loaded.
    pub fn config(&self, conf: &dyn ConfHelper) -> Value {
        match self {
            Self::Name(name) => conf.find_value(name).clone(),
            Self::Inline { settings, .. } => Value::Map(settings.clone()),
        }
    }
}

/// What the server reads from the configuration for itself.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    pub listen: String,
    pub modules: Vec<ModuleEntry>,
    #[serde(deserialize_with = "level")]
    pub log_level: Level,
    pub date_header: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_owned(),
            modules: DEFAULT_MODULES.iter().map(|name| ModuleEntry::Name((*name).to_owned())).collect(),
            log_level: Level::INFO,
            date_header: true,
        }
    }
}

impl Settings {
    /// Extracts the server settings from a configuration tree. Keys the
    /// server doesn't know are left to the modules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for settings of the wrong type.
    pub fn from_value(root: &Value) -> Result<Self, ConfigError> {
        let tree = serde_json::to_value(root)?;
        Ok(serde_json::from_value(tree)?)
    }
}

fn level<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
    let name = String::deserialize(deserializer)?;
    name.parse().map_err(serde::de::Error::custom)
}

/// Reads and parses a configuration file.
///
/// # Errors
///
/// Fails when the file can't be read or is not valid JSON.
pub fn load(path: impl AsRef<Path>) -> Result<ServerConfig, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
    Ok(ServerConfig::from_json(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_value(&Value::from_json("{}").unwrap()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.listen, DEFAULT_LISTEN);
        assert_eq!(settings.log_level, Level::INFO);
        assert!(settings.date_header);
        let names: Vec<_> = settings.modules.iter().map(ModuleEntry::name).collect();
        assert_eq!(names, DEFAULT_MODULES);
    }

    #[test]
    fn test_full_document() {
        let conf = ServerConfig::from_json(indoc! {r#"
            {
                "Listen": "0.0.0.0:80",
                "LogLevel": "debug",
                "DateHeader": false,
                "Modules": ["mod_http", { "name": "mod_rewrite", "Rules": { ".htm": ".html" } }],
                "mod_http": { "MaxHeadBytes": 16384 }
            }
        "#})
        .unwrap();
        let settings = Settings::from_value(conf.root()).unwrap();

        assert_eq!(settings.listen, "0.0.0.0:80");
        assert_eq!(settings.log_level, Level::DEBUG);
        assert!(!settings.date_header);
        assert_eq!(settings.modules[0].name(), "mod_http");
        assert_eq!(settings.modules[0].config(&conf).get("MaxHeadBytes").as_int(), Some(16384));
        assert_eq!(settings.modules[1].name(), "mod_rewrite");
        assert_eq!(settings.modules[1].config(&conf).pointer(["Rules", ".htm"]).as_str(), Some(".html"));
        assert!(settings.modules[1].config(&conf).get("name").is_null());
    }

    #[test]
    fn test_invalid_settings() {
        for json in [
            r#"{ "Listen": 80 }"#,
            r#"{ "Modules": "mod_http" }"#,
            r#"{ "Modules": [{ "Rules": {} }] }"#,
            r#"{ "LogLevel": "loud" }"#,
            r#"{ "DateHeader": "yes" }"#,
        ] {
            let root = Value::from_json(json).unwrap();
            assert!(matches!(Settings::from_value(&root), Err(ConfigError::Parse { .. })), "{json}");
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = load("/nonexistent/bref.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
