//! Settings for a tuning run and for the connection to the analysis host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::convergence::{
    ConvergeOptions, DEFAULT_FORCE_UNIT, DEFAULT_LOAD_CASE, DEFAULT_MAX_ITERATIONS,
    DEFAULT_TOLERANCE_PCT,
};
use crate::errors::{AdapterError, ConfigError};
use crate::stage::{StageStep, StageStepResolver, DEFAULT_STEP_OFFSET_FROM_END};

/// Environment variable holding the host address.
pub const HOST_URI_VAR: &str = "CABLETUNE_HOST_URI";
/// Environment variable holding the host port.
pub const HOST_PORT_VAR: &str = "CABLETUNE_HOST_PORT";
/// Environment variable holding the host API key.
pub const API_KEY_VAR: &str = "CABLETUNE_API_KEY";

/// Name of the file the host writes force table exports to.
pub const EXPORT_FILE_NAME: &str = "force-table.json";

/// Connection to the analysis host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Base URL of the host API, e.g. `https://127.0.0.1:10024/civil`.
    pub base_url: String,
    /// Key sent in the `MAPI-Key` header.
    pub api_key: String,
    /// Per-request timeout in seconds; analyses of large models are slow.
    pub timeout_secs: u64,
    /// Directory the host writes table exports into.
    pub export_dir: PathBuf,
    /// Accept the self-signed certificate the host serves on localhost.
    pub accept_invalid_certs: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: 600,
            export_dir: PathBuf::from("."),
            accept_invalid_certs: false,
        }
    }
}

impl HostConfig {
    /// Build a configuration from the host's advertised address, port and key.
    ///
    /// # Examples
    /// ```
    /// use cabletune::HostConfig;
    ///
    /// let config = HostConfig::from_parts("127.0.0.1", 10024, "secret");
    /// assert_eq!(config.base_url, "https://127.0.0.1:10024/civil");
    /// ```
    #[must_use]
    pub fn from_parts(uri: &str, port: u16, api_key: &str) -> Self {
        Self {
            base_url: format!("https://{uri}:{port}/civil"),
            api_key: api_key.to_owned(),
            ..Self::default()
        }
    }

    /// Whether both the URL and the key are set.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.base_url.is_empty() && !self.api_key.is_empty()
    }

    /// Request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Path the host is asked to write force exports to.
    #[must_use]
    pub fn export_path(&self) -> PathBuf {
        self.export_dir.join(EXPORT_FILE_NAME)
    }

    /// Fill the URL and key from `discovered` when they are not set.
    #[must_use]
    pub fn or_discovered(mut self, discovered: Option<HostConfig>) -> Self {
        if let Some(found) = discovered {
            if self.base_url.is_empty() {
                self.base_url = found.base_url;
            }
            if self.api_key.is_empty() {
                self.api_key = found.api_key;
            }
        }
        self
    }
}

/// Parameters of the tuning loop as stored in a settings file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningSettings {
    /// Convergence threshold in percent.
    pub tolerance_pct: f64,
    /// Maximum number of analysis passes.
    pub max_iterations: usize,
    /// Load case the forces are read from.
    pub load_case: String,
    /// Force unit of exported tables.
    pub force_unit: String,
    /// Row offset of the terminal step from the end of the step sequence.
    pub step_offset_from_end: usize,
    /// Fixed `stage:step` label, skipping resolution when set.
    pub stage_step: Option<String>,
    /// Directory iteration snapshots are written to.
    pub snapshot_dir: PathBuf,
}

impl Default for TuningSettings {
    fn default() -> Self {
        Self {
            tolerance_pct: DEFAULT_TOLERANCE_PCT,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            load_case: DEFAULT_LOAD_CASE.to_owned(),
            force_unit: DEFAULT_FORCE_UNIT.to_owned(),
            step_offset_from_end: DEFAULT_STEP_OFFSET_FROM_END,
            stage_step: None,
            snapshot_dir: PathBuf::from("."),
        }
    }
}

impl TuningSettings {
    /// Convert into loop options.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::InvalidValue`] when `stage_step` is not a `stage:step` label.
    pub fn to_options(&self) -> Result<ConvergeOptions, AdapterError> {
        Ok(ConvergeOptions {
            tolerance_pct: self.tolerance_pct,
            max_iterations: self.max_iterations,
            load_case: self.load_case.clone(),
            force_unit: self.force_unit.clone(),
            resolver: StageStepResolver::with_offset(self.step_offset_from_end),
            stage_step: self
                .stage_step
                .as_deref()
                .map(str::parse::<StageStep>)
                .transpose()?,
        })
    }
}

/// Complete settings file.
///
/// ```toml
/// [host]
/// base_url = "https://127.0.0.1:10024/civil"
/// api_key = "..."
///
/// [tuning]
/// tolerance_pct = 0.15
/// max_iterations = 20
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host connection.
    pub host: HostConfig,
    /// Loop parameters.
    pub tuning: TuningSettings,
}

impl Settings {
    /// Parse settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] when the text is not valid.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "loaded settings");
        Self::from_toml_str(&text)
    }
}

/// Probe the environment for the host connection.
///
/// Reads [`HOST_URI_VAR`], [`HOST_PORT_VAR`] and [`API_KEY_VAR`]; returns
/// `None` unless all three are present and the port is valid. Nothing is
/// written anywhere.
#[must_use]
pub fn discover_connection() -> Option<HostConfig> {
    discover_from(|name| std::env::var(name).ok())
}

/// Assemble a connection from a variable lookup.
pub fn discover_from(lookup: impl Fn(&str) -> Option<String>) -> Option<HostConfig> {
    let uri = lookup(HOST_URI_VAR)?;
    let port = lookup(HOST_PORT_VAR)?;
    let key = lookup(API_KEY_VAR)?;
    let Ok(port) = port.trim().parse::<u16>() else {
        debug!(port = %port, "ignoring discovered connection with invalid port");
        return None;
    };
    Some(HostConfig::from_parts(uri.trim(), port, key.trim()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = Settings::from_toml_str("").expect("empty settings are valid");
        assert_eq!(settings, Settings::default());
        assert!(!settings.host.is_complete());
        assert_eq!(settings.tuning.max_iterations, 20);
    }

    #[test]
    fn partial_file_overrides_fields() {
        let settings = Settings::from_toml_str(
            r#"
            [host]
            base_url = "https://10.0.0.2:8080/civil"
            api_key = "abc"
            accept_invalid_certs = true

            [tuning]
            tolerance_pct = 0.5
            stage_step = "CS12:003(last)"
            "#,
        )
        .expect("valid settings");
        assert!(settings.host.is_complete());
        assert_eq!(settings.host.timeout_secs, 600);

        let options = settings.tuning.to_options().expect("valid label");
        assert!((options.tolerance_pct - 0.5).abs() < f64::EPSILON);
        assert_eq!(
            options.stage_step,
            Some(StageStep::new("CS12", "003(last)"))
        );
        assert_eq!(options.resolver.step_offset_from_end, 3);
    }

    #[test]
    fn malformed_stage_step_is_rejected() {
        let tuning = TuningSettings {
            stage_step: Some("CS12".into()),
            ..TuningSettings::default()
        };
        assert!(tuning.to_options().is_err());
    }

    #[test]
    fn discovery_needs_every_variable() {
        let mut vars = HashMap::new();
        vars.insert(HOST_URI_VAR, "localhost".to_owned());
        vars.insert(HOST_PORT_VAR, "10024".to_owned());
        assert!(discover_from(|name| vars.get(name).cloned()).is_none());

        vars.insert(API_KEY_VAR, "key".to_owned());
        let found = discover_from(|name| vars.get(name).cloned()).expect("complete");
        assert_eq!(found.base_url, "https://localhost:10024/civil");

        vars.insert(HOST_PORT_VAR, "not-a-port".to_owned());
        assert!(discover_from(|name| vars.get(name).cloned()).is_none());
    }

    #[test]
    fn explicit_settings_win_over_discovery() {
        let explicit = HostConfig {
            api_key: "explicit".into(),
            ..HostConfig::default()
        };
        let merged = explicit.or_discovered(Some(HostConfig::from_parts("h", 1, "found")));
        assert_eq!(merged.base_url, "https://h:1/civil");
        assert_eq!(merged.api_key, "explicit");
    }
}
