//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default HTTP port for the pipeline service
pub const DEFAULT_PORT: u16 = 5790;

/// Default maximum time to keep retrying a locked database
pub const DEFAULT_LOCK_WAIT_MS: u64 = 5000;

/// Default timeout for one step backend request
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Service configuration read from `config.toml`
///
/// Every key is optional; anything missing falls back to the compiled default.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BookmillConfig {
    pub root_folder: Option<PathBuf>,
    pub port: u16,
    pub allowed_group_types: Vec<String>,
    pub allowed_section_types: Vec<String>,
    pub database_lock_wait_ms: u64,
    /// Base URL of the HTTP step backend; steps fail while unset
    pub step_backend_url: Option<String>,
    pub step_timeout_secs: u64,
}

impl Default for BookmillConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            port: DEFAULT_PORT,
            allowed_group_types: [
                "heading",
                "paragraph",
                "caption",
                "footnote",
                "page_number",
                "header",
                "footer",
                "quote",
                "list",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allowed_section_types: [
                "chapter",
                "front_matter",
                "back_matter",
                "illustration",
                "table_of_contents",
                "content",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            database_lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            step_backend_url: None,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
        }
    }
}

impl BookmillConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid config file: {}", e)))
    }

    /// Load configuration from an explicit file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from the explicit path if given, else the platform
    /// default location, else compiled defaults
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_file() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading config file");
                Self::load(&path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Enumerations consulted by the edit path
    pub fn value_domains(&self) -> ValueDomains {
        ValueDomains {
            group_types: self.allowed_group_types.clone(),
            section_types: self.allowed_section_types.clone(),
        }
    }
}

/// Finite enumerations of valid field values for edit payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDomains {
    pub group_types: Vec<String>,
    pub section_types: Vec<String>,
}

impl Default for ValueDomains {
    fn default() -> Self {
        BookmillConfig::default().value_domains()
    }
}

impl ValueDomains {
    /// Check a value for a constrained field.
    ///
    /// Fields other than `group_type` / `section_type` are unconstrained.
    pub fn validate(&self, field: &str, value: &serde_json::Value) -> Result<()> {
        let allowed = match field {
            "group_type" => &self.group_types,
            "section_type" => &self.section_types,
            _ => return Ok(()),
        };
        match value.as_str() {
            Some(s) if allowed.iter().any(|a| a == s) => Ok(()),
            Some(s) => Err(Error::InvalidInput(format!(
                "'{}' is not a permitted {} (allowed: {})",
                s,
                field,
                allowed.join(", ")
            ))),
            None => Err(Error::InvalidInput(format!("{} must be a string", field))),
        }
    }
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    config: &BookmillConfig,
) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(root) = &config.root_folder {
        return root.clone();
    }

    // Priority 4: OS-dependent compiled default
    get_default_root_folder()
}

/// Locate the platform configuration file, if one exists
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("bookmill").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/bookmill/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
fn get_default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/bookmill (or /var/lib/bookmill for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("bookmill"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/bookmill"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("bookmill"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/bookmill"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("bookmill"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\bookmill"))
    } else {
        PathBuf::from("./bookmill_data")
    }
}
