//! Export bundle layout, writer and reader.
//!
//! ```text
//! <dir>/
//!   sql_statements.sql[.gz]   BEGIN; ... COMMIT;
//!   sql_statements.sha256     digest of the script file as written
//!   version.txt               product_name = X / version = Y
//!   exportedChannels.txt      one software channel label per line
//!   exportedConfigs.txt       one configuration channel label per line
//!   packages/                 package files, by their stored path
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::server::ServerIdentity;

pub const SQL_FILE: &str = "sql_statements.sql";
pub const SQL_GZ_FILE: &str = "sql_statements.sql.gz";
pub const DIGEST_FILE: &str = "sql_statements.sha256";
pub const VERSION_FILE: &str = "version.txt";
pub const EXPORTED_CONFIGS_FILE: &str = "exportedConfigs.txt";
pub const EXPORTED_CHANNELS_FILE: &str = "exportedChannels.txt";
pub const PACKAGES_DIR: &str = "packages";
pub const IMAGES_DIR: &str = "images";

/// Create `dir` if missing and make sure nothing is in it.
pub fn prepare_output_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        if !dir.is_dir() {
            return Err(SyncError::Bundle(format!(
                "output path {} is not a directory",
                dir.display()
            )));
        }
        if std::fs::read_dir(dir)?.next().is_some() {
            return Err(SyncError::Bundle(format!(
                "output directory {} is not empty",
                dir.display()
            )));
        }
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Passes writes through while hashing them.
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(mut self) -> Result<String> {
        self.inner.flush()?;
        Ok(hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

enum ScriptWriter {
    Plain(DigestWriter<BufWriter<File>>),
    Gzip(GzEncoder<DigestWriter<BufWriter<File>>>),
}

impl Write for ScriptWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ScriptWriter::Plain(w) => w.write(buf),
            ScriptWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ScriptWriter::Plain(w) => w.flush(),
            ScriptWriter::Gzip(w) => w.flush(),
        }
    }
}

/// What a finished bundle holds.
#[derive(Debug, Clone, Serialize)]
pub struct BundleManifest {
    pub dir: PathBuf,
    pub script: PathBuf,
    pub digest: String,
    pub exported_channels: Vec<String>,
    pub exported_configs: Vec<String>,
}

/// Writes a bundle directory.
pub struct BundleWriter {
    dir: PathBuf,
    script_name: &'static str,
    script: ScriptWriter,
    exported_channels: Vec<String>,
    exported_configs: Vec<String>,
}

impl BundleWriter {
    /// Prepare `dir` and open the script inside a transaction.
    pub fn create(dir: impl Into<PathBuf>, compress: bool) -> Result<Self> {
        let dir = dir.into();
        prepare_output_dir(&dir)?;

        let script_name = if compress { SQL_GZ_FILE } else { SQL_FILE };
        let file = DigestWriter::new(BufWriter::new(File::create(dir.join(script_name))?));
        let mut script = if compress {
            ScriptWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            ScriptWriter::Plain(file)
        };
        writeln!(script, "BEGIN;")?;
        debug!("Writing {}", dir.join(script_name).display());

        Ok(Self {
            dir,
            script_name,
            script,
            exported_channels: Vec::new(),
            exported_configs: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sink for the statements of the export.
    pub fn script(&mut self) -> &mut (dyn Write + Send) {
        &mut self.script
    }

    /// Record the exporting server's identity.
    pub fn write_version(&self, identity: &ServerIdentity) -> Result<()> {
        std::fs::write(self.dir.join(VERSION_FILE), identity.to_version_file())?;
        Ok(())
    }

    /// Record a software channel written to the script.
    pub fn add_exported_channel(&mut self, label: &str) {
        self.exported_channels.push(label.to_string());
    }

    /// Record a configuration channel whose files the import must sync.
    pub fn add_exported_config(&mut self, label: &str) {
        self.exported_configs.push(label.to_string());
    }

    /// Destination of a package file stored at `relative` under the data dir.
    pub fn package_path(&self, relative: &str) -> PathBuf {
        self.dir.join(relative.trim_start_matches('/'))
    }

    /// Close the transaction and write the digest.
    pub fn finish(mut self) -> Result<BundleManifest> {
        writeln!(self.script, "COMMIT;")?;
        let digest = match self.script {
            ScriptWriter::Plain(w) => w.finish()?,
            ScriptWriter::Gzip(w) => w.finish()?.finish()?,
        };
        std::fs::write(
            self.dir.join(DIGEST_FILE),
            format!("{}  {}\n", digest, self.script_name),
        )?;

        write_labels(&self.dir.join(EXPORTED_CHANNELS_FILE), &self.exported_channels)?;
        write_labels(&self.dir.join(EXPORTED_CONFIGS_FILE), &self.exported_configs)?;

        info!("Bundle written to {}", self.dir.display());
        Ok(BundleManifest {
            script: self.dir.join(self.script_name),
            dir: self.dir,
            digest,
            exported_channels: self.exported_channels,
            exported_configs: self.exported_configs,
        })
    }
}

/// Reads a bundle directory.
#[derive(Debug, Clone)]
pub struct Bundle {
    dir: PathBuf,
}

impl Bundle {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(SyncError::Bundle(format!(
                "import directory {} does not exist",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Identity of the server that wrote the bundle.
    pub fn version(&self) -> Result<ServerIdentity> {
        let path = self.dir.join(VERSION_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            SyncError::Bundle(format!("cannot read {}: {}", path.display(), e))
        })?;
        ServerIdentity::parse_version_file(&content)
    }

    /// The script file, compressed preferred.
    pub fn script_path(&self) -> Result<PathBuf> {
        [SQL_GZ_FILE, SQL_FILE]
            .iter()
            .map(|name| self.dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                SyncError::Bundle(format!("no sql script found in {}", self.dir.display()))
            })
    }

    /// Check the script against its digest.
    ///
    /// Returns false when the bundle carries no digest.
    pub fn verify_digest(&self) -> Result<bool> {
        let digest_path = self.dir.join(DIGEST_FILE);
        if !digest_path.is_file() {
            info!("No {} in bundle, skipping verification", DIGEST_FILE);
            return Ok(false);
        }
        let recorded = std::fs::read_to_string(&digest_path)?;
        let recorded = recorded.split_whitespace().next().unwrap_or_default();

        let script = self.script_path()?;
        let mut reader = BufReader::new(File::open(&script)?);
        let mut hasher = Sha256::new();
        loop {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            hasher.update(buf);
            let n = buf.len();
            reader.consume(n);
        }
        let actual = hex::encode(hasher.finalize());

        if !actual.eq_ignore_ascii_case(recorded) {
            return Err(SyncError::Bundle(format!(
                "digest mismatch for {}: expected {}, got {}",
                script.display(),
                recorded,
                actual
            )));
        }
        debug!("Digest of {} verified", script.display());
        Ok(true)
    }

    /// A line reader over the script, decompressed if needed.
    pub fn open_script(&self) -> Result<Box<dyn BufRead + Send>> {
        let path = self.script_path()?;
        let file = File::open(&path)?;
        if path.extension().is_some_and(|e| e == "gz") {
            Ok(Box::new(BufReader::new(GzDecoder::new(file))))
        } else {
            Ok(Box::new(BufReader::new(file)))
        }
    }

    /// Software channel labels the bundle holds.
    pub fn exported_channels(&self) -> Result<Vec<String>> {
        read_labels(&self.dir.join(EXPORTED_CHANNELS_FILE))
    }

    /// Configuration channel labels to sync after import.
    pub fn exported_configs(&self) -> Result<Vec<String>> {
        read_labels(&self.dir.join(EXPORTED_CONFIGS_FILE))
    }

    /// A bundle subdirectory, if present.
    pub fn subdir(&self, name: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        path.is_dir().then_some(path)
    }
}

/// One label per line; nothing is written for an empty list.
fn write_labels(path: &Path, labels: &[String]) -> Result<()> {
    if labels.is_empty() {
        return Ok(());
    }
    let mut content = labels.join("\n");
    content.push('\n');
    std::fs::write(path, content)?;
    Ok(())
}

fn read_labels(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
