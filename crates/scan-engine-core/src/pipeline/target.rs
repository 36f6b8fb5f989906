use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static EMBEDDED_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:https?://|www\.)[^\s<>"']+"#).unwrap_or_else(|err| {
        unreachable!("embedded URL pattern is a literal: {err}")
    })
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Url,
    Message,
    File,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Url => "url",
            TargetKind::Message => "message",
            TargetKind::File => "file",
        }
    }
}

/// What a scan looks at, plus facts extracted upstream (DNS answers, form
/// actions, the brand a page claims to be).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTarget {
    #[serde(default)]
    pub kind: TargetKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_addresses: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub form_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_brand: Option<String>,
}

impl ScanTarget {
    pub fn new(kind: TargetKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            resolved_addresses: Vec::new(),
            form_actions: Vec::new(),
            claimed_brand: None,
        }
    }

    pub fn url(value: impl Into<String>) -> Self {
        Self::new(TargetKind::Url, value)
    }

    pub fn message(value: impl Into<String>) -> Self {
        Self::new(TargetKind::Message, value)
    }

    pub fn file(value: impl Into<String>) -> Self {
        Self::new(TargetKind::File, value)
    }

    pub fn with_resolved(mut self, addr: IpAddr) -> Self {
        self.resolved_addresses.push(addr);
        self
    }

    pub fn with_form_action(mut self, action: impl Into<String>) -> Self {
        self.form_actions.push(action.into());
        self
    }

    pub fn with_claimed_brand(mut self, brand: impl Into<String>) -> Self {
        self.claimed_brand = Some(brand.into());
        self
    }

    /// URLs the target points at: the value itself for URL targets, every
    /// embedded link for messages, none for files.
    pub fn urls(&self) -> Vec<UrlParts> {
        match self.kind {
            TargetKind::Url => UrlParts::parse(self.value.trim()).into_iter().collect(),
            TargetKind::Message => EMBEDDED_URL
                .find_iter(&self.value)
                .filter_map(|m| UrlParts::parse(m.as_str()))
                .collect(),
            TargetKind::File => Vec::new(),
        }
    }

    /// Every host the target references, lowercased.
    pub fn hosts(&self) -> Vec<String> {
        self.urls().into_iter().map(|url| url.host).collect()
    }
}

/// Minimal split of a URL into the pieces the lexical checks need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub raw: String,
    pub scheme: String,
    pub userinfo: Option<String>,
    pub host: String,
    pub path_and_query: String,
}

impl UrlParts {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let (scheme, rest) = match raw.find("://") {
            Some(idx) => (raw[..idx].to_ascii_lowercase(), &raw[idx + 3..]),
            None => match raw.split_once(':') {
                // Opaque schemes such as `javascript:` or `data:` have no host.
                Some((scheme, _)) if is_opaque_scheme(scheme) => {
                    return Some(Self {
                        raw: raw.to_string(),
                        scheme: scheme.to_ascii_lowercase(),
                        userinfo: None,
                        host: String::new(),
                        path_and_query: String::new(),
                    });
                }
                _ => (String::new(), raw),
            },
        };

        let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (authority, path_and_query) = rest.split_at(authority_end);
        let (userinfo, host_port) = match authority.rsplit_once('@') {
            Some((user, host)) => (Some(user.to_string()), host),
            None => (None, authority),
        };
        let host = strip_port(host_port).trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }

        Some(Self {
            raw: raw.to_string(),
            scheme,
            userinfo,
            host,
            path_and_query: path_and_query.to_string(),
        })
    }

    pub fn ip_host(&self) -> Option<IpAddr> {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.host.split('.').filter(|label| !label.is_empty()).collect()
    }

    pub fn tld(&self) -> Option<&str> {
        self.labels().last().copied()
    }

    /// Last two labels of the host; close enough to a registrable domain for
    /// brand comparisons.
    pub fn registrable_domain(&self) -> String {
        let labels = self.labels();
        let start = labels.len().saturating_sub(2);
        labels[start..].join(".")
    }

    pub fn path(&self) -> &str {
        let end = self
            .path_and_query
            .find(['?', '#'])
            .unwrap_or(self.path_and_query.len());
        &self.path_and_query[..end]
    }
}

fn is_opaque_scheme(scheme: &str) -> bool {
    matches!(
        scheme.to_ascii_lowercase().as_str(),
        "javascript" | "data" | "vbscript" | "mailto"
    )
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
