/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs::{metadata, read_dir, read_to_string, try_exists};
use tracing::{info, warn};

#[cfg(not(test))]
use anyhow::anyhow;

const CONFIG_FILE: &str = ".dropbox/info.json";
const DEFAULT_SYNC_DIR: &str = "Dropbox";
// Team accounts use a suffixed folder, e.g. "Dropbox (Acme Team)"
const TEAM_SYNC_DIR_PREFIX: &str = "Dropbox (";

/// Per-account entry of the daemon's info.json, keyed by account type.
#[derive(Deserialize, Debug)]
struct AccountInfo {
    path: Option<PathBuf>,
}

#[cfg(not(test))]
pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(anyhow!("No home directory found"))
}

#[cfg(test)]
pub(crate) fn home_dir() -> Result<PathBuf> {
    Ok(crate::path("home"))
}

pub(crate) fn config_file() -> Result<PathBuf> {
    Ok(home_dir()?.join(CONFIG_FILE))
}

/// Looks up the configured sync directory, falling back to the default
/// locations when the configuration has none. `None` means the user has not
/// set up the daemon yet; there's not much we can do then.
pub(crate) async fn sync_directory() -> Result<Option<PathBuf>> {
    let config_file = config_file()?;

    info!("Looking for the sync daemon configuration...");
    if !try_exists(&config_file).await? {
        info!("Sync daemon configuration not found");
        return Ok(None);
    }
    info!("Found configuration at {}", config_file.display());

    let contents = read_to_string(&config_file).await?;
    if let Some(directory) = configured_directory(&contents)? {
        return Ok(Some(directory));
    }

    warn!("Could not find a valid sync directory in the configuration. Falling back to defaults...");
    default_sync_directory().await
}

fn configured_directory(contents: &str) -> Result<Option<PathBuf>> {
    let accounts: BTreeMap<String, AccountInfo> = match serde_json::from_str(contents) {
        Ok(accounts) => accounts,
        Err(err) => {
            warn!("Error loading account data from the configuration: {err}");
            return Ok(None);
        }
    };

    for (account_type, account) in accounts {
        let Some(path) = account.path else {
            continue;
        };
        let directory = expand_home(path)?;
        info!(
            "Found configured sync directory at {} ({account_type} account)",
            directory.display()
        );
        return Ok(Some(directory));
    }

    warn!("Could not find the user's account in the configuration file");
    Ok(None)
}

fn expand_home(path: PathBuf) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home_dir()?.join(rest)),
        Err(_) => Ok(path),
    }
}

async fn default_sync_directory() -> Result<Option<PathBuf>> {
    let home = home_dir()?;

    let default_dir = home.join(DEFAULT_SYNC_DIR);
    if matches!(metadata(&default_dir).await, Ok(meta) if meta.is_dir()) {
        return Ok(Some(default_dir));
    }

    // No default folder found; the last attempt is to look for a team
    // folder, used in business accounts
    let Ok(mut dir) = read_dir(&home).await else {
        return Ok(None);
    };
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(TEAM_SYNC_DIR_PREFIX) && entry.file_type().await?.is_dir() {
            return Ok(Some(entry.path()));
        }
    }

    Ok(None)
}
