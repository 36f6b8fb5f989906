use std::{collections::BTreeMap, fs, net::IpAddr, path::Path};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::TiSource;

use super::target::ScanTarget;

/// A positive answer from a threat-intelligence source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntelMatch {
    pub indicator: String,
    /// The indicator is a known sinkhole (a seized or parked malicious domain).
    #[serde(default)]
    pub sinkhole: bool,
}

/// Looks a target up in one TI source.
#[async_trait]
pub trait ThreatIntelProvider: Send + Sync {
    async fn lookup(&self, source: &TiSource, target: &ScanTarget) -> Result<Option<IntelMatch>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Domain,
    Url,
    Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    #[serde(rename = "type")]
    pub kind: IndicatorKind,
    pub value: String,
    #[serde(default)]
    pub sinkhole: bool,
}

impl Indicator {
    fn of(kind: IndicatorKind, value: &str) -> Self {
        Self {
            kind,
            value: value.trim().to_string(),
            sinkhole: false,
        }
    }

    pub fn domain(value: &str) -> Self {
        Self::of(IndicatorKind::Domain, &value.to_ascii_lowercase())
    }

    pub fn url(value: &str) -> Self {
        Self::of(IndicatorKind::Url, value)
    }

    pub fn address(addr: IpAddr) -> Self {
        Self::of(IndicatorKind::Address, &addr.to_string())
    }

    pub fn sinkholed(mut self) -> Self {
        self.sinkhole = true;
        self
    }
}

/// Static per-source indicator lists, keyed by TI source id.
///
/// ```json
/// { "urlhaus": [ { "type": "domain", "value": "bad.example" },
///                { "type": "address", "value": "192.0.2.1", "sinkhole": true } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorFeed {
    sources: BTreeMap<String, Vec<Indicator>>,
}

impl IndicatorFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a feed from a JSON (or JSON5, by extension) document.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read indicator feed at {}", path.display()))?;
        let feed: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json5") => json5::from_str(&raw)
                .with_context(|| format!("invalid JSON5 indicator feed at {}", path.display()))?,
            _ => serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON indicator feed at {}", path.display()))?,
        };
        feed.validate()?;
        Ok(feed)
    }

    pub fn with_indicator(mut self, source_id: impl Into<String>, indicator: Indicator) -> Self {
        self.sources.entry(source_id.into()).or_default().push(indicator);
        self
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self) -> Result<()> {
        for (source, indicators) in &self.sources {
            for indicator in indicators {
                if indicator.value.trim().is_empty() {
                    bail!("source `{source}` has an empty indicator");
                }
                if indicator.kind == IndicatorKind::Address
                    && indicator.value.parse::<IpAddr>().is_err()
                {
                    bail!("source `{source}` lists invalid address {:?}", indicator.value);
                }
            }
        }
        Ok(())
    }

    /// First indicator of `source_id` that matches the target.
    pub fn matches(&self, source_id: &str, target: &ScanTarget) -> Option<IntelMatch> {
        let indicators = self.sources.get(source_id)?;
        let urls = target.urls();
        indicators.iter().find_map(|indicator| {
            let hit = match indicator.kind {
                IndicatorKind::Domain => {
                    let domain = indicator.value.to_ascii_lowercase();
                    urls.iter().any(|url| {
                        url.host == domain || url.host.ends_with(&format!(".{domain}"))
                    })
                }
                IndicatorKind::Url => {
                    let wanted = normalize_url(&indicator.value);
                    urls.iter().any(|url| normalize_url(&url.raw) == wanted)
                }
                IndicatorKind::Address => match indicator.value.parse::<IpAddr>() {
                    Ok(addr) => {
                        target.resolved_addresses.contains(&addr)
                            || urls.iter().any(|url| url.ip_host() == Some(addr))
                    }
                    Err(_) => false,
                },
            };
            hit.then(|| IntelMatch {
                indicator: indicator.value.clone(),
                sinkhole: indicator.sinkhole,
            })
        })
    }
}

fn normalize_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_ascii_lowercase()
}

#[async_trait]
impl ThreatIntelProvider for IndicatorFeed {
    async fn lookup(&self, source: &TiSource, target: &ScanTarget) -> Result<Option<IntelMatch>> {
        Ok(self.matches(&source.id, target))
    }
}
