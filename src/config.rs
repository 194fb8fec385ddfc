// Configuration loading and validation.
//
// Settings live in `config/client.toml` next to the binary. On first run the
// shipped defaults are copied from `defaults/` into `config/`; files the
// operator already edited are never overwritten.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },
    #[error("failed to parse {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config value for {field}: {message}")]
    ValidationError { field: String, message: String },
    #[error("failed to copy default configs: {message}")]
    DefaultsCopyError { message: String },
}

/// Everything the client needs to run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// REST base, e.g. `http://localhost:3001`.
    pub base_url: String,
    /// Event stream endpoint, usually `{base_url}/sse`.
    pub sse_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Focus a newly created account as soon as its event arrives.
    #[serde(default = "default_focus_new_accounts")]
    pub focus_new_accounts: bool,
    /// Seconds of stream silence tolerated before logging a warning.
    #[serde(default = "default_stale_stream_secs")]
    pub stale_stream_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            focus_new_accounts: default_focus_new_accounts(),
            stale_stream_secs: default_stale_stream_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_focus_new_accounts() -> bool {
    true
}

fn default_stale_stream_secs() -> u64 {
    30
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("server.base_url", &self.server.base_url)?;
        validate_url("server.sse_url", &self.server.sse_url)?;
        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError {
                field: "server.request_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.engine.stale_stream_secs == 0 {
            return Err(ConfigError::ValidationError {
                field: "engine.stale_stream_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            field: field.to_string(),
            message: format!("must be an http(s) URL, got: {value}"),
        })
    }
}

/// Load and validate the config from `<base_dir>/config/client.toml`.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join("client.toml");
    let raw = read_file(&path)?;
    let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::ParseError {
        path: path.clone(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Copy any missing config files from `defaults/` into `config/`.
///
/// Files already present in `config/` are left alone, so operator edits
/// survive restarts and upgrades. `.example` files are never copied. It is
/// an error for both directories to be missing, since the client would have
/// nothing at all to run with.
pub fn ensure_config_files(base_dir: &Path) -> Result<(), ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() && !config_dir.exists() {
        return Err(ConfigError::DefaultsCopyError {
            message: format!(
                "neither {} nor {} exists",
                defaults_dir.display(),
                config_dir.display()
            ),
        });
    }
    if !defaults_dir.exists() {
        // Nothing to copy from; whatever is in config/ has to do.
        return Ok(());
    }

    fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("cannot create {}: {e}", config_dir.display()),
    })?;

    let entries = fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("cannot read {}: {e}", defaults_dir.display()),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError { message: e.to_string() })?;
        let source_path = entry.path();
        if !source_path.is_file() {
            continue;
        }
        if source_path.extension().is_some_and(|ext| ext == "example") {
            continue;
        }
        let Some(file_name) = source_path.file_name() else {
            continue;
        };
        let dest_path = config_dir.join(file_name);

        // create_new loses the race politely: an existing file stays as-is.
        match fs::OpenOptions::new().write(true).create_new(true).open(&dest_path) {
            Ok(mut dest) => {
                let contents =
                    fs::read(&source_path).map_err(|e| ConfigError::DefaultsCopyError {
                        message: format!("cannot read {}: {e}", source_path.display()),
                    })?;
                dest.write_all(&contents)
                    .map_err(|e| ConfigError::DefaultsCopyError {
                        message: format!("cannot write {}: {e}", dest_path.display()),
                    })?;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("cannot create {}: {e}", dest_path.display()),
                });
            }
        }
    }
    Ok(())
}

/// Load the config relative to the current working directory, copying
/// defaults into place first if needed.
pub fn load_config() -> Result<Config, ConfigError> {
    ensure_config_files(Path::new("."))?;
    load_config_from(Path::new("."))
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
    }
    fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound { path: path.to_path_buf() })
}
