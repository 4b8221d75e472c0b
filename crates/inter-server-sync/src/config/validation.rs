//! Configuration validation.

use chrono::{NaiveDate, NaiveDateTime};

use super::Config;
use crate::error::{Result, SyncError};

/// Validate the settings every command needs.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.host.is_empty() {
        return Err(SyncError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(SyncError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(SyncError::Config("source.user is required".into()));
    }
    if config.source.max_connections == 0 {
        return Err(SyncError::Config(
            "source.max_connections must be at least 1".into(),
        ));
    }

    if config.export.batch_size == 0 {
        return Err(SyncError::Config(
            "export.batch_size must be at least 1".into(),
        ));
    }
    if let Some(date) = &config.export.packages_only_after {
        parse_since(date)?;
    }
    if let Some(org) = config.export.org_limit.iter().find(|id| **id <= 0) {
        return Err(SyncError::Config(format!(
            "export.org_limit: invalid organization id {}",
            org
        )));
    }

    Ok(())
}

/// Validate the settings an export needs on top of [`validate`].
pub fn validate_export(config: &Config) -> Result<()> {
    validate(config)?;
    if config.export.output_dir.is_none() {
        return Err(SyncError::Config("export.output_dir is required".into()));
    }
    if !config.export.has_subjects() {
        return Err(SyncError::Config(
            "nothing to export: set export.channels, export.channel_with_children, \
             export.config_channels, export.images or export.containers"
                .into(),
        ));
    }
    Ok(())
}

/// Validate the settings an import needs on top of [`validate`].
pub fn validate_import(config: &Config) -> Result<()> {
    validate(config)?;
    if config.import.import_dir.is_none() {
        return Err(SyncError::Config("import.import_dir is required".into()));
    }
    Ok(())
}

/// Parse a `YYYY-MM-DD` or `YYYY-MM-DD hh:mm:ss` date.
pub fn parse_since(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(ts);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| {
            SyncError::Config(format!(
                "invalid date '{}': expected YYYY-MM-DD or YYYY-MM-DD hh:mm:ss",
                value
            ))
        })
}
