//! Configuration management with hot-reload support.
//!
//! Structured the same way as the teacher's daemon config: a TOML file
//! loaded through `toml`, compiled include/exclude glob patterns held
//! separately from the raw config so matching doesn't re-parse on every
//! event, and a file-mtime poll loop for hot-reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sentinelfs_system::CoreConfig;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub watch: WatchConfig,
    pub tunables: TunablesConfig,
    pub patterns: PatternConfig,
    pub logging: LoggingConfig,
}

/// The directory this daemon watches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub root: PathBuf,
}

/// The three tunables the core exposes (SPEC_FULL.md §6), plus nothing
/// else — this struct exists purely to give them a TOML home.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunablesConfig {
    pub quiet_period_secs: u64,
    pub copy_group_expiry_secs: u64,
    pub empty_file_grace_secs: u64,
}

impl TunablesConfig {
    pub fn to_core_config(&self) -> CoreConfig {
        CoreConfig {
            quiet_period: Duration::from_secs(self.quiet_period_secs),
            copy_group_expiry: Duration::from_secs(self.copy_group_expiry_secs),
            empty_file_grace: Duration::from_secs(self.empty_file_grace_secs),
        }
    }
}

impl Default for TunablesConfig {
    fn default() -> Self {
        let defaults = CoreConfig::default();
        Self {
            quiet_period_secs: defaults.quiet_period.as_secs(),
            copy_group_expiry_secs: defaults.copy_group_expiry.as_secs(),
            empty_file_grace_secs: defaults.empty_file_grace.as_secs(),
        }
    }
}

/// File pattern configuration, applied to released events before they
/// are printed (the core itself has no notion of include/exclude).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            watch: WatchConfig::default(),
            tunables: TunablesConfig::default(),
            patterns: PatternConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            include: vec!["**/*".to_string()],
            exclude: vec![
                "**/.git/**".to_string(),
                "**/target/**".to_string(),
                "**/node_modules/**".to_string(),
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Compiled pattern matcher, rebuilt whenever `PatternConfig` changes.
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    include: GlobSet,
    exclude: GlobSet,
}

impl CompiledPatterns {
    pub fn new(config: &PatternConfig) -> Result<Self> {
        let mut include_builder = GlobSetBuilder::new();
        for pattern in &config.include {
            let glob = Glob::new(pattern)
                .with_context(|| format!("invalid include pattern: {pattern}"))?;
            include_builder.add(glob);
        }

        let mut exclude_builder = GlobSetBuilder::new();
        for pattern in &config.exclude {
            let glob = Glob::new(pattern)
                .with_context(|| format!("invalid exclude pattern: {pattern}"))?;
            exclude_builder.add(glob);
        }

        Ok(Self {
            include: include_builder.build()?,
            exclude: exclude_builder.build()?,
        })
    }

    /// Whether a released event's path should be surfaced to the caller.
    pub fn should_watch(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.include.is_match(&*path_str) && !self.exclude.is_match(&*path_str)
    }
}

/// Configuration manager with hot-reload capability.
pub struct ConfigManager {
    config: Arc<RwLock<DaemonConfig>>,
    patterns: Arc<RwLock<CompiledPatterns>>,
    config_path: Option<PathBuf>,
    change_sender: broadcast::Sender<DaemonConfig>,
}

impl ConfigManager {
    pub fn new() -> Self {
        let config = DaemonConfig::default();
        let patterns =
            CompiledPatterns::new(&config.patterns).expect("default patterns are always valid");
        let (change_sender, _) = broadcast::channel(10);

        Self {
            config: Arc::new(RwLock::new(config)),
            patterns: Arc::new(RwLock::new(patterns)),
            config_path: None,
            change_sender,
        }
    }

    pub async fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let config_str = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let new_config: DaemonConfig =
            toml::from_str(&config_str).with_context(|| "failed to parse config file")?;
        let patterns = CompiledPatterns::new(&new_config.patterns)?;

        {
            let mut guard = self.config.write().await;
            *guard = new_config.clone();
        }
        {
            let mut guard = self.patterns.write().await;
            *guard = patterns;
        }
        self.config_path = Some(path.to_path_buf());

        if let Err(e) = self.change_sender.send(new_config) {
            debug!("no config change subscribers: {}", e);
        }
        info!("loaded configuration from: {}", path.display());
        Ok(())
    }

    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config = self.config.read().await;
        let config_str = toml::to_string_pretty(&*config)?;
        tokio::fs::write(path.as_ref(), config_str)
            .await
            .with_context(|| format!("failed to write config file: {}", path.as_ref().display()))?;
        info!("saved configuration to: {}", path.as_ref().display());
        Ok(())
    }

    pub async fn get_config(&self) -> DaemonConfig {
        self.config.read().await.clone()
    }

    pub async fn get_patterns(&self) -> CompiledPatterns {
        self.patterns.read().await.clone()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<DaemonConfig> {
        self.change_sender.subscribe()
    }

    /// Polls the config file's mtime once a second and hot-reloads on change.
    pub async fn start_hot_reload(&self) -> Result<()> {
        let config_path = self
            .config_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no config file loaded"))?
            .clone();
        let config = Arc::clone(&self.config);
        let patterns = Arc::clone(&self.patterns);
        let change_sender = self.change_sender.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            let mut last_modified = None;

            loop {
                interval.tick().await;
                match tokio::fs::metadata(&config_path).await {
                    Ok(metadata) => {
                        let modified = metadata.modified().ok();
                        if last_modified.is_none() {
                            last_modified = modified;
                            continue;
                        }
                        if modified != last_modified {
                            last_modified = modified;
                            match Self::reload_config(&config_path, &config, &patterns).await {
                                Ok(new_config) => {
                                    info!("hot-reloaded configuration");
                                    let _ = change_sender.send(new_config);
                                }
                                Err(e) => warn!("failed to hot-reload config: {}", e),
                            }
                        }
                    }
                    Err(e) => warn!("failed to check config file: {}", e),
                }
            }
        });

        info!("started configuration hot-reload monitoring");
        Ok(())
    }

    async fn reload_config(
        path: &Path,
        config: &Arc<RwLock<DaemonConfig>>,
        patterns: &Arc<RwLock<CompiledPatterns>>,
    ) -> Result<DaemonConfig> {
        let config_str = tokio::fs::read_to_string(path).await?;
        let new_config: DaemonConfig = toml::from_str(&config_str)?;
        let new_patterns = CompiledPatterns::new(&new_config.patterns)?;

        {
            let mut guard = config.write().await;
            *guard = new_config.clone();
        }
        {
            let mut guard = patterns.write().await;
            *guard = new_patterns;
        }
        Ok(new_config)
    }

    /// Sanity-checks a loaded config (`sentinelfs validate`).
    pub fn validate(config: &DaemonConfig) -> Result<()> {
        if config.tunables.quiet_period_secs == 0 {
            anyhow::bail!("tunables.quiet_period_secs must be > 0");
        }
        if !config.watch.root.exists() {
            anyhow::bail!(
                "watch.root does not exist: {}",
                config.watch.root.display()
            );
        }
        for pattern in &config.patterns.include {
            Glob::new(pattern).with_context(|| format!("invalid include pattern: {pattern}"))?;
        }
        for pattern in &config.patterns.exclude {
            Glob::new(pattern).with_context(|| format!("invalid exclude pattern: {pattern}"))?;
        }
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn loads_and_overrides_defaults_from_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_toml = r#"
[watch]
root = "."

[tunables]
quiet_period_secs = 5
copy_group_expiry_secs = 600
empty_file_grace_secs = 3

[patterns]
include = ["**/*.rs"]
exclude = ["**/target/**"]

[logging]
level = "debug"
"#;
        temp_file.write_all(config_toml.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let mut manager = ConfigManager::new();
        manager.load_from_file(temp_file.path()).await.unwrap();

        let config = manager.get_config().await;
        assert_eq!(config.tunables.quiet_period_secs, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn pattern_matching_excludes_target_directory() {
        let config = PatternConfig {
            include: vec!["**/*.rs".to_string()],
            exclude: vec!["**/target/**".to_string()],
        };
        let patterns = CompiledPatterns::new(&config).unwrap();
        assert!(patterns.should_watch(Path::new("src/main.rs")));
        assert!(!patterns.should_watch(Path::new("target/debug/main.rs")));
        assert!(!patterns.should_watch(Path::new("README.md")));
    }

    #[test]
    fn validate_rejects_zero_quiet_period() {
        let mut config = DaemonConfig::default();
        config.tunables.quiet_period_secs = 0;
        assert!(ConfigManager::validate(&config).is_err());
    }
}
