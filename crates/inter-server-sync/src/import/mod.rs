//! Applies a bundle to the local server.
//!
//! The bundle is checked before anything touches the database: its version
//! must match the local server and its script must match the recorded digest.
//! The script is then streamed to the database piece by piece.

mod script;

pub use script::{stream_script, ScriptPieces, SCRIPT_PIECE_BYTES};

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::bundle::{Bundle, IMAGES_DIR, PACKAGES_DIR};
use crate::config::{Config, ImportConfig};
use crate::error::{Result, SyncError};
use crate::server::ServerIdentity;
use crate::source::PgRowSource;

const RSYNC: &str = "rsync";
const SPACECMD: &str = "spacecmd";
const SYNC_SALT_FILES: &str = "configchannel.syncSaltFilesOnDisk";

/// Result of an import run.
#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the import started.
    pub started_at: DateTime<Utc>,

    /// When the import completed.
    pub completed_at: DateTime<Utc>,

    /// Bundle directory.
    pub import_dir: PathBuf,

    /// Script that was applied.
    pub script: PathBuf,

    /// Pieces the script was sent in.
    pub script_pieces: usize,

    /// Whether the script was checked against a digest.
    pub verified: bool,

    /// Whether package files were mirrored.
    pub packages_synced: bool,

    /// Whether image files were mirrored.
    pub images_synced: bool,

    /// Configuration channels whose files were recreated on disk.
    pub config_channels: Vec<String>,

    /// Configuration channels whose sync failed.
    pub failed_config_channels: Vec<String>,
}

impl ImportResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A bundle that passed its checks and is ready to apply.
#[derive(Debug)]
pub struct PreparedImport {
    pub bundle: Bundle,
    pub script_path: PathBuf,
    pub verified: bool,
}

/// Runs an import described by a configuration.
pub struct Importer {
    config: Config,
}

impl Importer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate_import()?;
        Ok(Self { config })
    }

    fn import_dir(&self) -> Result<&Path> {
        self.config
            .import
            .import_dir
            .as_deref()
            .ok_or_else(|| SyncError::Config("import.import_dir is required".into()))
    }

    /// Check the bundle against the local server and its script digest.
    pub fn prepare(&self, local: &ServerIdentity) -> Result<PreparedImport> {
        let bundle = Bundle::open(self.import_dir()?)?;
        let exported = bundle.version()?;
        local.ensure_matches(&exported)?;
        info!("Bundle version {} matches local server", exported);

        let script_path = bundle.script_path()?;
        let verified = if self.config.import.skip_verify {
            warn!("Skipping digest verification of {}", script_path.display());
            false
        } else {
            bundle.verify_digest()?
        };

        Ok(PreparedImport {
            bundle,
            script_path,
            verified,
        })
    }

    /// Run the whole import against the configured database.
    pub async fn run(&self) -> Result<ImportResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting import run: {}", run_id);

        let local = ServerIdentity::load(&self.config.server)?;
        let prepared = self.prepare(&local)?;
        let import = &self.config.import;

        let packages_synced = match prepared.bundle.subdir(PACKAGES_DIR) {
            Some(dir) => {
                run_rsync(&package_rsync_args(&dir, &import.packages_dir)).await?;
                true
            }
            None => {
                info!("No package files to import");
                false
            }
        };
        let images_synced = match prepared.bundle.subdir(IMAGES_DIR) {
            Some(dir) => {
                run_rsync(&image_rsync_args(&dir, &import.images_dir)).await?;
                true
            }
            None => {
                info!("No image files to import");
                false
            }
        };

        info!("Applying {}", prepared.script_path.display());
        let target = PgRowSource::connect(&self.config.source).await?;
        let script_pieces = target
            .execute_script(stream_script(prepared.bundle.open_script()?))
            .await?;
        info!("SQL import complete ({} pieces)", script_pieces);

        let labels = prepared.bundle.exported_configs()?;
        let failed_config_channels = if labels.is_empty() {
            debug!("No configuration channels to sync on disk");
            Vec::new()
        } else {
            sync_config_files(import, &labels).await
        };

        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        info!("Import run {} finished in {:.1}s", run_id, duration);

        Ok(ImportResult {
            run_id,
            duration_seconds: duration,
            started_at,
            completed_at,
            import_dir: prepared.bundle.dir().to_path_buf(),
            script: prepared.script_path,
            script_pieces,
            verified: prepared.verified,
            packages_synced,
            images_synced,
            config_channels: labels,
            failed_config_channels,
        })
    }
}

fn with_trailing_slash(dir: &Path) -> String {
    let dir = dir.display().to_string();
    if dir.ends_with('/') {
        dir
    } else {
        format!("{}/", dir)
    }
}

fn verbose_flag(args: &mut Vec<String>) {
    if tracing::enabled!(tracing::Level::DEBUG) {
        args.push("-v".to_string());
    }
}

/// rsync arguments mirroring bundle packages into the package store.
pub fn package_rsync_args(from: &Path, to: &Path) -> Vec<String> {
    let mut args = vec!["-og".to_string(), "--chown=wwwrun:www".to_string()];
    verbose_flag(&mut args);
    args.push("-r".to_string());
    args.push(with_trailing_slash(from));
    args.push(with_trailing_slash(to));
    args
}

/// rsync arguments mirroring bundle images into the image store.
pub fn image_rsync_args(from: &Path, to: &Path) -> Vec<String> {
    let mut args = vec![
        "-og".to_string(),
        "--chown=salt:susemanager".to_string(),
        "--chmod=Du=rwx,Dgo=rx,Fu=rw,Fgo=r".to_string(),
    ];
    verbose_flag(&mut args);
    args.push("-r".to_string());
    args.push("--exclude=pillars".to_string());
    args.push(with_trailing_slash(from));
    args.push(to.display().to_string());
    args
}

async fn run_rsync(args: &[String]) -> Result<()> {
    let command = format!("{} {}", RSYNC, args.join(" "));
    info!("Running {}", command);
    let output = Command::new(RSYNC)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| SyncError::command(&command, e))?;
    if !output.status.success() {
        return Err(SyncError::command(
            command,
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    debug!("{}", String::from_utf8_lossy(&output.stdout).trim());
    Ok(())
}

/// spacecmd arguments calling the salt file sync for one label.
pub fn spacecmd_args(import: &ImportConfig, label: &str) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(user) = &import.config_sync_user {
        args.push("-u".to_string());
        args.push(user.clone());
    }
    if let Some(password) = &import.config_sync_password {
        args.push("-p".to_string());
        args.push(password.clone());
    }
    args.push("--".to_string());
    args.push("api".to_string());
    args.push(SYNC_SALT_FILES.to_string());
    args.push("-A".to_string());
    args.push(format!("[[\"{}\"]]", label));
    args
}

/// The command an operator runs by hand when the sync fails.
fn manual_sync_command(label: &str) -> String {
    format!("{} api {} -A '[[\"{}\"]]'", SPACECMD, SYNC_SALT_FILES, label)
}

/// Recreate the files of each configuration channel on disk.
///
/// Returns the labels that failed; failures never abort the import.
async fn sync_config_files(import: &ImportConfig, labels: &[String]) -> Vec<String> {
    let mut failed = Vec::new();
    for label in labels {
        debug!("Syncing files of configuration channel {}", label);
        let output = Command::new(SPACECMD)
            .args(spacecmd_args(import, label))
            .stdin(Stdio::null())
            .output()
            .await;
        let error = match output {
            Ok(out) if out.status.success() => continue,
            Ok(out) => String::from_utf8_lossy(&out.stderr).trim().to_string(),
            Err(e) => e.to_string(),
        };
        warn!(
            "Error recreating configuration files of {}: {}. Please run {}",
            label,
            error,
            manual_sync_command(label)
        );
        failed.push(label.clone());
    }
    failed
}
