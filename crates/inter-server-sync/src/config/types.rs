//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::UnknownTablePolicy;
use crate::export::ImageKind;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database the server keeps its content in.
    pub source: DatabaseConfig,

    /// Identity of the local server.
    #[serde(default)]
    pub server: ServerConfig,

    /// What to export and where.
    #[serde(default)]
    pub export: ExportConfig,

    /// How to apply an export bundle.
    #[serde(default)]
    pub import: ImportConfig,
}

/// How the pool secures its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Plain TCP; the usual setup for a server's local database.
    #[default]
    Disable,
    /// Encrypted, server not authenticated.
    Require,
    /// Encrypted, certificate and host name checked against the webpki roots.
    #[serde(alias = "verify-ca")]
    VerifyFull,
}

/// PostgreSQL connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode (default: disable).
    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Pool size (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Where the server's identity is read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `key = value` files, later files do not override earlier keys.
    #[serde(default = "default_config_files")]
    pub config_files: Vec<PathBuf>,

    /// Product name, overriding the config files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,

    /// Product version, overriding the config files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Root of the server's package store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_files: default_config_files(),
            product_name: None,
            version: None,
            data_dir: default_data_dir(),
        }
    }
}

/// Export behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Bundle directory. Created if missing, must be empty.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Software channel labels.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Parent channel labels, exported together with their children.
    #[serde(default)]
    pub channel_with_children: Vec<String>,

    /// Configuration channel labels.
    #[serde(default)]
    pub config_channels: Vec<String>,

    /// Export OS image metadata.
    #[serde(default)]
    pub images: bool,

    /// Export container image metadata.
    #[serde(default)]
    pub containers: bool,

    /// Organizations image metadata is limited to. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub org_limit: Vec<i64>,

    /// Skip copying package files.
    #[serde(default)]
    pub metadata_only: bool,

    /// Only export channel packages and errata modified after this date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages_only_after: Option<String>,

    /// Write `sql_statements.sql.gz` instead of plain SQL (default: true).
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Keys fetched per query (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Handling of references to tables outside the loaded schema.
    #[serde(default)]
    pub unknown_tables: UnknownTablePolicy,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            channels: Vec::new(),
            channel_with_children: Vec::new(),
            config_channels: Vec::new(),
            images: false,
            containers: false,
            org_limit: Vec::new(),
            metadata_only: false,
            packages_only_after: None,
            compress: true,
            batch_size: default_batch_size(),
            unknown_tables: UnknownTablePolicy::default(),
        }
    }
}

impl ExportConfig {
    /// Check if any subject is configured.
    pub fn has_subjects(&self) -> bool {
        !self.channels.is_empty()
            || !self.channel_with_children.is_empty()
            || !self.config_channels.is_empty()
            || self.images
            || self.containers
    }

    /// Image kinds requested, OS images first.
    pub fn image_kinds(&self) -> Vec<ImageKind> {
        [(self.images, ImageKind::OsImage), (self.containers, ImageKind::Container)]
            .into_iter()
            .filter_map(|(wanted, kind)| wanted.then_some(kind))
            .collect()
    }
}

/// Import behavior configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Bundle directory.
    #[serde(default)]
    pub import_dir: Option<PathBuf>,

    /// Skip checking the script digest.
    #[serde(default)]
    pub skip_verify: bool,

    /// Destination of mirrored package files.
    #[serde(default = "default_packages_dir")]
    pub packages_dir: PathBuf,

    /// Destination of mirrored OS images.
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,

    /// User for the configuration channel sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_sync_user: Option<String>,

    /// Password for the configuration channel sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_sync_password: Option<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            import_dir: None,
            skip_verify: false,
            packages_dir: default_packages_dir(),
            images_dir: default_images_dir(),
            config_sync_user: None,
            config_sync_password: None,
        }
    }
}

impl fmt::Debug for ImportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportConfig")
            .field("import_dir", &self.import_dir)
            .field("skip_verify", &self.skip_verify)
            .field("packages_dir", &self.packages_dir)
            .field("images_dir", &self.images_dir)
            .field("config_sync_user", &self.config_sync_user)
            .field(
                "config_sync_password",
                &self.config_sync_password.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_max_connections() -> usize {
    4
}

fn default_config_files() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/rhn/rhn.conf"),
        PathBuf::from("/usr/share/rhn/config-defaults/rhn_web.conf"),
        PathBuf::from("/usr/share/rhn/config-defaults/rhn.conf"),
    ]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/spacewalk")
}

fn default_batch_size() -> usize {
    crate::dump::DEFAULT_BATCH_SIZE
}

fn default_packages_dir() -> PathBuf {
    PathBuf::from("/var/spacewalk/packages/")
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("/srv/www/os-images")
}

fn default_true() -> bool {
    true
}
