use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::transfer::DEFAULT_IDLE_GRACE;

const APP_DIR_NAME: &str = "nextsync";
const DATABASE_FILE: &str = "nextsync.db";
const DEFAULT_SUCCESS_RETENTION: u64 = 30;
const DEFAULT_RETRY_BASE_SECS: u64 = 30;
const DEFAULT_RETRY_MAX_SECS: u64 = 900;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    /// Per-account storage area for downloads and moved or copied uploads.
    pub storage_root: PathBuf,
    pub server_url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub remember_password: bool,
    pub success_retention: usize,
    pub idle_grace: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub unmetered: bool,
    pub charging: bool,
    pub power_saving: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_dir = std::env::var("NEXTSYNC_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_data_dir);
        let storage_root = std::env::var("NEXTSYNC_STORAGE_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| data_dir.join("files"));
        let success_retention =
            read_u64_env("NEXTSYNC_SUCCESS_RETENTION", DEFAULT_SUCCESS_RETENTION);
        let idle_grace = Duration::from_millis(read_u64_env(
            "NEXTSYNC_IDLE_GRACE_MS",
            DEFAULT_IDLE_GRACE.as_millis() as u64,
        ));
        let retry_base =
            Duration::from_secs(read_u64_env("NEXTSYNC_RETRY_BASE_SECS", DEFAULT_RETRY_BASE_SECS));
        let retry_max =
            Duration::from_secs(read_u64_env("NEXTSYNC_RETRY_MAX_SECS", DEFAULT_RETRY_MAX_SECS));

        Ok(Self {
            data_dir,
            storage_root,
            server_url: read_string_env("NEXTSYNC_SERVER_URL"),
            user: read_string_env("NEXTSYNC_USER"),
            password: read_string_env("NEXTSYNC_PASSWORD"),
            remember_password: read_bool_env("NEXTSYNC_REMEMBER_PASSWORD", false),
            success_retention: usize::try_from(success_retention).unwrap_or(usize::MAX),
            idle_grace,
            retry_base,
            retry_max: retry_max.max(retry_base),
            unmetered: read_bool_env("NEXTSYNC_ON_WIFI", true),
            charging: read_bool_env("NEXTSYNC_CHARGING", true),
            power_saving: read_bool_env("NEXTSYNC_POWER_SAVE", false),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| parse_flag(&value))
        .unwrap_or(default)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_with_home_handles_tilde() {
        let home = PathBuf::from("/home/alice");
        assert_eq!(expand_with_home("~", &home), home);
        assert_eq!(
            expand_with_home("~/Nextcloud", &home),
            PathBuf::from("/home/alice/Nextcloud")
        );
        assert_eq!(
            expand_with_home("/srv/data", &home),
            PathBuf::from("/srv/data")
        );
    }

    #[test]
    fn flags_accept_common_spellings() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(parse_flag(value), "{value}");
        }
        for value in ["0", "false", "off", ""] {
            assert!(!parse_flag(value), "{value}");
        }
    }

    #[test]
    fn database_lives_in_data_dir() {
        let config = DaemonConfig {
            data_dir: PathBuf::from("/var/lib/nextsync"),
            storage_root: PathBuf::from("/var/lib/nextsync/files"),
            server_url: None,
            user: None,
            password: None,
            remember_password: false,
            success_retention: 30,
            idle_grace: DEFAULT_IDLE_GRACE,
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(900),
            unmetered: true,
            charging: true,
            power_saving: false,
        };
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/nextsync/nextsync.db")
        );
    }
}
