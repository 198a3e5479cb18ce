//! Configuration management for research-clerk

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::engine::Policy;
use crate::error::{ClerkError, Result};
use crate::provider::CommandProvider;
use crate::watch::WatchSettings;

const APP_DIR: &str = "research-clerk";
const DATABASE_FILE: &str = "zotero.sqlite";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub policy: Policy,
    pub watch: WatchConfig,
    pub owner: OwnerConfig,
    pub provider: ProviderConfig,
    /// Where suggestion files are written
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Explicit zotero.sqlite, skips auto-detection
    pub path: Option<PathBuf>,
    /// Defaults to `backups/` next to the database
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub poll_interval_secs: u64,
    /// Grace period before the owning app is force-stopped
    pub stop_timeout_secs: u64,
    pub max_missing_polls: u32,
    pub watermark_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerConfig {
    /// Command used to relaunch the app
    pub binary: String,
    /// Exact process name to look up and signal
    pub process_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            stop_timeout_secs: 10,
            max_missing_polls: 5,
            watermark_path: None,
        }
    }
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            binary: "zotero".to_string(),
            process_name: "zotero".to_string(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
            model: Some("claude-haiku-4-5".to_string()),
        }
    }
}

impl ProviderConfig {
    /// Expand the short aliases `haiku` and `sonnet`.
    pub fn model_name(&self) -> Option<String> {
        self.model.as_deref().map(|m| match m {
            "haiku" => "claude-haiku-4-5".to_string(),
            "sonnet" => "claude-sonnet-4-5".to_string(),
            other => other.to_string(),
        })
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
    }

    /// Load from `path`, or from the default location if `None`. A missing
    /// default file means defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(ClerkError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.policy;
        if p.max_depth == 0 {
            return Err(ClerkError::Config("policy.max_depth must be at least 1".into()));
        }
        if p.min_tags > p.max_tags {
            return Err(ClerkError::Config(format!(
                "policy.min_tags ({}) exceeds policy.max_tags ({})",
                p.min_tags, p.max_tags
            )));
        }
        if self.watch.max_missing_polls == 0 {
            return Err(ClerkError::Config("watch.max_missing_polls must be at least 1".into()));
        }
        Ok(())
    }

    /// The configured database, or the first existing auto-detect candidate.
    pub fn locate_database(&self) -> Result<PathBuf> {
        let candidates = match &self.database.path {
            Some(path) => vec![path.clone()],
            None => database_candidates(
                std::env::var_os("ZOTERO_DATA_DIR").map(PathBuf::from),
                dirs::home_dir(),
            ),
        };

        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            return Ok(found.clone());
        }
        Err(ClerkError::DatabaseNotFound(candidates))
    }

    pub fn backup_dir_for(&self, database: &Path) -> PathBuf {
        self.database.backup_dir.clone().unwrap_or_else(|| {
            database
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("backups")
        })
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(data_dir)
    }

    pub fn watermark_path(&self) -> PathBuf {
        self.watch
            .watermark_path
            .clone()
            .unwrap_or_else(|| data_dir().join("watermark"))
    }

    pub fn watch_settings(&self, database: &Path) -> WatchSettings {
        WatchSettings {
            poll_interval: Duration::from_secs(self.watch.poll_interval_secs),
            stop_timeout: Duration::from_secs(self.watch.stop_timeout_secs),
            max_missing_polls: self.watch.max_missing_polls,
            backup_dir: self.backup_dir_for(database),
            output_dir: self.output_dir(),
            watermark_path: self.watermark_path(),
            policy: self.policy,
        }
    }

    pub fn command_provider(&self) -> CommandProvider {
        CommandProvider::new(
            self.provider.command.clone(),
            self.provider.args.clone(),
            self.provider.model_name(),
            self.policy,
        )
    }
}

/// Where Zotero keeps its data, most specific first.
pub fn database_candidates(data_dir: Option<PathBuf>, home: Option<PathBuf>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = data_dir {
        candidates.push(dir.join(DATABASE_FILE));
    }
    if let Some(home) = home {
        candidates.push(home.join("Zotero").join(DATABASE_FILE));
        candidates.push(home.join(".zotero").join("zotero").join(DATABASE_FILE));
        candidates.push(
            home.join("snap")
                .join("zotero-snap")
                .join("common")
                .join("Zotero")
                .join(DATABASE_FILE),
        );
    }
    candidates
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.policy.max_depth, 3);
        assert_eq!(config.policy.min_tags, 2);
        assert_eq!(config.policy.max_tags, 5);
        assert_eq!(config.policy.min_new_collection_support, 3);
        assert_eq!(config.watch.poll_interval_secs, 60);
        assert_eq!(config.watch.stop_timeout_secs, 10);
        assert_eq!(config.owner.process_name, "zotero");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            "[watch]\npoll_interval_secs = 5\n\n[policy]\nmax_tags = 4\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.watch.poll_interval_secs, 5);
        assert_eq!(config.watch.stop_timeout_secs, 10);
        assert_eq!(config.policy.max_tags, 4);
        assert_eq!(config.policy.min_tags, 2);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let err = Config::load(Some(&tmp.path().join("nope.toml"))).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[policy]\nmin_tags = 6\n").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(ClerkError::Config(_))));
    }

    #[test]
    fn test_candidates_order() {
        let candidates = database_candidates(
            Some(PathBuf::from("/custom")),
            Some(PathBuf::from("/home/u")),
        );
        assert_eq!(candidates[0], PathBuf::from("/custom/zotero.sqlite"));
        assert_eq!(candidates[1], PathBuf::from("/home/u/Zotero/zotero.sqlite"));
        assert_eq!(candidates.len(), 4);
    }

    #[test]
    fn test_locate_explicit_database() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("zotero.sqlite");
        let mut config = Config::default();
        config.database.path = Some(db.clone());

        assert!(matches!(
            config.locate_database(),
            Err(ClerkError::DatabaseNotFound(ref c)) if c == &vec![db.clone()]
        ));

        fs::write(&db, b"").unwrap();
        assert_eq!(config.locate_database().unwrap(), db);
        assert_eq!(config.backup_dir_for(&db), tmp.path().join("backups"));
    }

    #[test]
    fn test_model_aliases() {
        let mut provider = ProviderConfig::default();
        provider.model = Some("sonnet".into());
        assert_eq!(provider.model_name().as_deref(), Some("claude-sonnet-4-5"));
        provider.model = None;
        assert_eq!(provider.model_name(), None);
    }
}
