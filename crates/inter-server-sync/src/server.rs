//! Identity of the local server: product name and version.
//!
//! Both sides of a transfer must run the same product at the same version,
//! so the export records the identity in `version.txt` and the import
//! refuses bundles that do not match.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{Result, SyncError};

/// Product assumed when the configuration names none.
pub const DEFAULT_PRODUCT: &str = "SUSE Manager";

/// Product name recorded for every product other than [`DEFAULT_PRODUCT`].
pub const COMMUNITY_PRODUCT: &str = "uyuni";

const PRODUCT_KEYS: &[&str] = &["product_name", "web.product_name"];

/// `key = value` settings from a list of files, first file wins.
#[derive(Debug, Default)]
pub struct Properties {
    files: Vec<(PathBuf, BTreeMap<String, String>)>,
}

impl Properties {
    /// Read every file that exists. Missing files are skipped.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut files = Vec::new();
        for path in paths {
            match std::fs::read_to_string(path) {
                Ok(content) => files.push((path.clone(), parse_properties(&content))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Config file {} not found, skipping", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Self { files })
    }

    pub fn from_content(path: impl AsRef<Path>, content: &str) -> Self {
        Self {
            files: vec![(path.as_ref().to_path_buf(), parse_properties(content))],
        }
    }

    /// First value for any of `keys`, trying keys in order and files in order.
    pub fn first(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| {
            self.files
                .iter()
                .find_map(|(_, values)| values.get(*key).map(String::as_str))
        })
    }
}

/// Parse `key = value` lines. Lines without `=` are ignored.
pub fn parse_properties(content: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.starts_with('#') {
            continue;
        }
        values
            .entry(key.to_string())
            .or_insert_with(|| value.trim().to_string());
    }
    values
}

/// Product name and version of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerIdentity {
    pub product_name: String,
    pub version: String,
}

impl ServerIdentity {
    /// Determine the local identity from the configured files and overrides.
    pub fn load(config: &ServerConfig) -> Result<Self> {
        let properties = Properties::load(&config.config_files)?;
        Self::resolve(&properties, config)
    }

    /// Determine the identity from already-read settings.
    pub fn resolve(properties: &Properties, config: &ServerConfig) -> Result<Self> {
        let product = config
            .product_name
            .as_deref()
            .or_else(|| properties.first(PRODUCT_KEYS))
            .unwrap_or(DEFAULT_PRODUCT);

        let (product_name, version_key) = if product == DEFAULT_PRODUCT {
            (DEFAULT_PRODUCT, "web.version")
        } else {
            (COMMUNITY_PRODUCT, "web.version.uyuni")
        };

        let version = config
            .version
            .as_deref()
            .or_else(|| properties.first(&[version_key]))
            .ok_or_else(|| {
                SyncError::Config(format!("no version found for product {}", product_name))
            })?;

        Ok(Self {
            product_name: product_name.to_string(),
            version: version.to_string(),
        })
    }

    /// Parse the content of a bundle's `version.txt`.
    pub fn parse_version_file(content: &str) -> Result<Self> {
        let values = parse_properties(content);
        let field = |key: &str| {
            values
                .get(key)
                .cloned()
                .ok_or_else(|| SyncError::Bundle(format!("version.txt has no {}", key)))
        };
        Ok(Self {
            product_name: field("product_name")?,
            version: field("version")?,
        })
    }

    /// Content of a bundle's `version.txt`.
    pub fn to_version_file(&self) -> String {
        format!(
            "product_name = {}\nversion = {}\n",
            self.product_name, self.version
        )
    }

    /// Fail unless `bundle` was written by the same product and version.
    pub fn ensure_matches(&self, bundle: &ServerIdentity) -> Result<()> {
        if self == bundle {
            return Ok(());
        }
        Err(SyncError::VersionMismatch {
            bundle_product: bundle.product_name.clone(),
            bundle_version: bundle.version.clone(),
            server_product: self.product_name.clone(),
            server_version: self.version.clone(),
        })
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.product_name, self.version)
    }
}
