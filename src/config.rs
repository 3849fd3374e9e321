use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::AtomsError;

pub const DEFAULT_CONFIG_FILE: &str = "load-atoms.json";
pub const DEFAULT_WORKERS: usize = 8;
pub const MAX_WORKERS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub root: Utf8PathBuf,
    /// Where `<id>/<id>.json` manifests are served from. Empty means only
    /// local and registered manifests can be loaded.
    pub base_remote_url: String,
    pub verbose: bool,
    pub debug: bool,
    pub testing: bool,
    pub strict_checksums: bool,
    pub download_workers: usize,
}

impl Settings {
    /// Settings rooted at an explicit cache directory, everything else default.
    pub fn with_root(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            base_remote_url: String::new(),
            verbose: true,
            debug: false,
            testing: false,
            strict_checksums: false,
            download_workers: DEFAULT_WORKERS,
        }
    }

    pub fn from_env() -> Result<Self, AtomsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AtomsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let root = match lookup("LOAD_ATOMS_ROOT").filter(|value| !value.is_empty()) {
            Some(root) => Utf8PathBuf::from(root),
            None => default_root()?,
        };
        let mut settings = Self::with_root(root);
        if let Some(url) = lookup("LOAD_ATOMS_BASE_URL").filter(|value| !value.is_empty()) {
            settings.base_remote_url = url;
        }
        if let Some(value) = lookup("LOAD_ATOMS_VERBOSE") {
            settings.verbose = parse_flag(&value).unwrap_or(true);
        }
        settings.debug = lookup("LOAD_ATOMS_DEBUG").as_deref() == Some("1");
        settings.testing = lookup("LOAD_ATOMS_TESTING").as_deref() == Some("1");
        settings.strict_checksums = lookup("LOAD_ATOMS_STRICT_CHECKSUMS").as_deref() == Some("1");
        if let Some(value) = lookup("LOAD_ATOMS_WORKERS") {
            let workers = value.trim().parse::<usize>().map_err(|_| {
                AtomsError::Config(format!("LOAD_ATOMS_WORKERS must be a number, got {value:?}"))
            })?;
            settings.download_workers = clamp_workers(workers);
        }
        Ok(settings)
    }

    /// Debug and testing runs keep downloaded raw files around for inspection.
    pub fn keep_scratch(&self) -> bool {
        self.debug || self.testing
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub base_remote_url: Option<String>,
    #[serde(default)]
    pub verbose: Option<bool>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub testing: Option<bool>,
    #[serde(default)]
    pub strict_checksums: Option<bool>,
    #[serde(default)]
    pub download_workers: Option<usize>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Environment settings overlaid with a JSON config file. An explicit path
    /// must exist; the default `load-atoms.json` is optional.
    pub fn resolve(path: Option<&str>) -> Result<Settings, AtomsError> {
        let settings = Settings::from_env()?;
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(settings);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|err| AtomsError::Config(format!("{}: {err}", config_path.display())))?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|err| AtomsError::Config(format!("{}: {err}", config_path.display())))?;

        Ok(Self::apply(settings, file))
    }

    pub fn apply(mut settings: Settings, file: ConfigFile) -> Settings {
        if let Some(root) = file.root {
            settings.root = Utf8PathBuf::from(root);
        }
        if let Some(url) = file.base_remote_url {
            settings.base_remote_url = url;
        }
        if let Some(verbose) = file.verbose {
            settings.verbose = verbose;
        }
        if let Some(debug) = file.debug {
            settings.debug = debug;
        }
        if let Some(testing) = file.testing {
            settings.testing = testing;
        }
        if let Some(strict) = file.strict_checksums {
            settings.strict_checksums = strict;
        }
        if let Some(workers) = file.download_workers {
            settings.download_workers = clamp_workers(workers);
        }
        settings
    }
}

pub fn default_root() -> Result<Utf8PathBuf, AtomsError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(".load-atoms")).ok())
        .ok_or_else(|| AtomsError::Config("unable to resolve home directory".to_string()))
}

fn clamp_workers(workers: usize) -> usize {
    workers.clamp(1, MAX_WORKERS)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
