use anyhow::{Context, bail};
use kura_queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
};

pub const CONFIG_PATH_VAR: &str = "KURA_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "KURA_CONFIG_JSON";
pub const DATABASE_URL_VAR: &str = "KURA_DATABASE_URL";

const DEFAULT_FILES: &[&str] = &["kura.toml", "kura.json", "config/kura.toml"];

/// Where the effective settings came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SettingsSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Document format of a settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsFormat {
    Toml,
    Json,
}

impl SettingsFormat {
    /// Trusts a `.toml` or `.json` extension. Anything else is JSON when the
    /// document opens with `{` and TOML otherwise.
    pub fn detect(path: &Path, contents: &str) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ if contents.trim_start().starts_with('{') => Self::Json,
            _ => Self::Toml,
        }
    }
}

impl fmt::Display for SettingsFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Toml => "TOML",
            Self::Json => "JSON",
        })
    }
}

/// Process-level settings for a Kura node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KuraSettings {
    /// Dispatcher tuning: worker pool size, retry backoff, per-tag caps.
    pub queue: QueueConfig,
    /// SQLite connection URL for the command store.
    pub database_url: String,
    /// `tracing` filter directives used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
}

impl Default for KuraSettings {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            database_url: "sqlite://kura.db".to_string(),
            log_filter: None,
        }
    }
}

/// Raw environment inputs, gathered once so resolution stays testable.
#[derive(Debug, Clone, Default)]
pub struct EnvSources {
    pub config_path: Option<String>,
    pub config_json: Option<String>,
    pub database_url: Option<String>,
}

impl EnvSources {
    pub fn gather() -> Self {
        let read = |key: &str| env::var(key).ok().filter(|value| !value.trim().is_empty());
        Self {
            config_path: read(CONFIG_PATH_VAR),
            config_json: read(CONFIG_JSON_VAR),
            database_url: read(DATABASE_URL_VAR),
        }
    }
}

impl KuraSettings {
    /// Loads `.env` if present, then resolves settings from the environment.
    /// Evaluation order:
    /// 1) `$KURA_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$KURA_CONFIG_JSON` (inline JSON),
    /// 3) `kura.toml`, `kura.json` or `config/kura.toml` in the working directory,
    /// 4) defaults.
    ///
    /// `$KURA_DATABASE_URL` overrides the database URL from any source.
    pub fn load_from_env() -> anyhow::Result<(Self, SettingsSource)> {
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(err) => return Err(err).context("failed to read .env"),
        }
        Self::resolve(&EnvSources::gather(), Path::new("."))
    }

    /// Resolves settings from already gathered inputs. Default files are
    /// looked up relative to `root`.
    pub fn resolve(
        sources: &EnvSources,
        root: &Path,
    ) -> anyhow::Result<(Self, SettingsSource)> {
        let (mut settings, source) = if let Some(path) = &sources.config_path {
            let path = PathBuf::from(path);
            (Self::load_from_file(&path)?, SettingsSource::EnvPath(path))
        } else if let Some(raw) = &sources.config_json {
            let parsed = Self::parse(raw, SettingsFormat::Json)
                .with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?;
            (parsed, SettingsSource::EnvInline)
        } else if let Some(path) = Self::find_default_file(root) {
            (Self::load_from_file(&path)?, SettingsSource::File(path))
        } else {
            (Self::default(), SettingsSource::Default)
        };

        if let Some(url) = &sources.database_url {
            settings.database_url = url.clone();
            settings
                .validate()
                .with_context(|| format!("invalid {DATABASE_URL_VAR}"))?;
        }
        Ok((settings, source))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let format = SettingsFormat::detect(path, &contents);
        Self::parse(&contents, format)
            .with_context(|| format!("invalid {format} settings in {}", path.display()))
    }

    /// Parses and validates one settings document.
    pub fn parse(contents: &str, format: SettingsFormat) -> anyhow::Result<Self> {
        let settings: Self = match format {
            SettingsFormat::Toml => toml::from_str(contents)?,
            SettingsFormat::Json => serde_json::from_str(contents)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Checks values the store and dispatcher cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.database_url.starts_with("sqlite:") {
            bail!(
                "database_url `{}` is not a sqlite URL",
                self.database_url
            );
        }
        if self.queue.workers == 0 {
            bail!("queue.workers must be at least 1");
        }
        if let Some((tag, _)) = self.queue.tag_caps.iter().find(|(_, cap)| **cap == 0) {
            bail!("queue.tag_caps.{tag} is 0; disable the work type instead");
        }
        Ok(())
    }

    fn find_default_file(root: &Path) -> Option<PathBuf> {
        DEFAULT_FILES
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.exists())
    }
}
