use std::{net::IpAddr, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Runtime knobs for the scan pipeline: timeouts, fan-out width and the
/// sinkhole address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub ti_timeout: Duration,
    pub ai_timeout: Duration,
    pub stage2_timeout: Duration,
    pub scan_timeout: Duration,
    pub probe_timeout: Duration,
    pub max_concurrency: usize,
    pub sinkholes: Vec<IpAddr>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ti_timeout: Duration::from_secs(3),
            ai_timeout: Duration::from_secs(10),
            stage2_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            max_concurrency: 8,
            sinkholes: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    ti_timeout: Option<String>,
    ai_timeout: Option<String>,
    stage2_timeout: Option<String>,
    scan_timeout: Option<String>,
    probe_timeout: Option<String>,
    max_concurrency: Option<usize>,
    #[serde(default)]
    sinkholes: Vec<String>,
}

impl EngineSettings {
    pub const ENV_PREFIX: &'static str = "SCAN_ENGINE";

    /// Load settings from an optional file (TOML, YAML or JSON by extension)
    /// overlaid with `SCAN_ENGINE_*` environment variables.
    ///
    /// * `SCAN_ENGINE_TI_TIMEOUT=2s`
    /// * `SCAN_ENGINE_MAX_CONCURRENCY=16`
    /// * `SCAN_ENGINE_SINKHOLES=192.0.2.1,198.51.100.7`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                bail!("settings file {} does not exist", path.display());
            }
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(Self::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("sinkholes"),
        );
        let raw: RawSettings = builder
            .build()
            .context("failed to assemble engine settings")?
            .try_deserialize()
            .context("engine settings have an unexpected shape")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self> {
        let defaults = Self::default();
        let duration = |field: &str, value: Option<String>, fallback: Duration| -> Result<Duration> {
            match value {
                Some(text) => humantime::parse_duration(text.trim())
                    .with_context(|| format!("`{field}` must be a duration such as \"2s\", got {text:?}")),
                None => Ok(fallback),
            }
        };

        let max_concurrency = raw.max_concurrency.unwrap_or(defaults.max_concurrency);
        if max_concurrency == 0 {
            bail!("`max_concurrency` must be at least 1");
        }
        let sinkholes = raw
            .sinkholes
            .iter()
            .map(|addr| {
                addr.trim()
                    .parse::<IpAddr>()
                    .with_context(|| format!("invalid sinkhole address {addr:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            ti_timeout: duration("ti_timeout", raw.ti_timeout, defaults.ti_timeout)?,
            ai_timeout: duration("ai_timeout", raw.ai_timeout, defaults.ai_timeout)?,
            stage2_timeout: duration("stage2_timeout", raw.stage2_timeout, defaults.stage2_timeout)?,
            scan_timeout: duration("scan_timeout", raw.scan_timeout, defaults.scan_timeout)?,
            probe_timeout: duration("probe_timeout", raw.probe_timeout, defaults.probe_timeout)?,
            max_concurrency,
            sinkholes,
        })
    }

    pub fn is_sinkhole(&self, addr: &IpAddr) -> bool {
        self.sinkholes.contains(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use parking_lot::Mutex;
    use std::{env, fs};

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn clear_env() {
        for key in [
            "SCAN_ENGINE_TI_TIMEOUT",
            "SCAN_ENGINE_SCAN_TIMEOUT",
            "SCAN_ENGINE_MAX_CONCURRENCY",
            "SCAN_ENGINE_SINKHOLES",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_without_file_or_env() {
        let _guard = ENV_LOCK.lock();
        clear_env();
        let settings = EngineSettings::load(None).unwrap();
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn reads_yaml_file() {
        let _guard = ENV_LOCK.lock();
        clear_env();
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        fs::write(
            file.path(),
            "ti_timeout: 750ms\nstage2_timeout: 2s\nmax_concurrency: 3\nsinkholes:\n  - 192.0.2.1\n",
        )
        .unwrap();

        let settings = EngineSettings::load(Some(file.path())).unwrap();
        assert_eq!(settings.ti_timeout, Duration::from_millis(750));
        assert_eq!(settings.stage2_timeout, Duration::from_secs(2));
        assert_eq!(settings.max_concurrency, 3);
        assert!(settings.is_sinkhole(&"192.0.2.1".parse().unwrap()));
        assert_eq!(settings.ai_timeout, EngineSettings::default().ai_timeout);
    }

    #[test]
    fn environment_overrides_file() {
        let _guard = ENV_LOCK.lock();
        clear_env();
        let file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        fs::write(file.path(), r#"{"scan_timeout": "10s", "max_concurrency": 2}"#).unwrap();
        env::set_var("SCAN_ENGINE_MAX_CONCURRENCY", "12");
        env::set_var("SCAN_ENGINE_SINKHOLES", "198.51.100.7,203.0.113.9");

        let settings = EngineSettings::load(Some(file.path()));
        clear_env();
        let settings = settings.unwrap();
        assert_eq!(settings.scan_timeout, Duration::from_secs(10));
        assert_eq!(settings.max_concurrency, 12);
        assert_eq!(settings.sinkholes.len(), 2);
    }

    #[test]
    fn single_underscore_environment_keys_apply_without_file() {
        let _guard = ENV_LOCK.lock();
        clear_env();
        env::set_var("SCAN_ENGINE_TI_TIMEOUT", "750ms");
        env::set_var("SCAN_ENGINE_MAX_CONCURRENCY", "5");
        env::set_var("SCAN_ENGINE_SINKHOLES", "192.0.2.1");

        let settings = EngineSettings::load(None);
        clear_env();
        let settings = settings.unwrap();
        assert_eq!(settings.ti_timeout, Duration::from_millis(750));
        assert_eq!(settings.max_concurrency, 5);
        assert!(settings.is_sinkhole(&"192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn rejects_bad_durations_and_zero_concurrency() {
        let raw = RawSettings {
            ti_timeout: Some("soon".into()),
            ..RawSettings::default()
        };
        let err = EngineSettings::from_raw(raw).unwrap_err();
        assert!(err.to_string().contains("ti_timeout"));

        let raw = RawSettings {
            max_concurrency: Some(0),
            ..RawSettings::default()
        };
        assert!(EngineSettings::from_raw(raw).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineSettings::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
