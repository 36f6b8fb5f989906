//! Check evaluation. The engine asks a [`CheckEvaluator`] whether a catalog
//! check fires for a target; [`LexicalCheckEvaluator`] answers for every
//! default check from the target text and upstream facts alone.

use std::collections::BTreeMap;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

use crate::catalog::Check;

use super::target::{ScanTarget, TargetKind, UrlParts};

/// Decides whether a single check fires. `Ok(Some(evidence))` when it does.
#[async_trait]
pub trait CheckEvaluator: Send + Sync {
    async fn evaluate(&self, check: &Check, target: &ScanTarget) -> Result<Option<String>>;
}

const LONG_URL_CHARS: usize = 100;
const MAX_HOST_LABELS: usize = 4;

const SUSPICIOUS_TLDS: &[&str] = &[
    "zip", "mov", "xyz", "top", "tk", "ml", "ga", "cf", "gq", "work", "click", "country", "loan",
    "rest", "fit", "men", "cam", "icu",
];

const SHORTENERS: &[&str] = &[
    "bit.ly", "tinyurl.com", "t.co", "goo.gl", "ow.ly", "is.gd", "buff.ly", "rebrand.ly",
    "cutt.ly", "shorturl.at", "tiny.cc",
];

const FREE_HOSTING: &[&str] = &[
    "000webhostapp.com", "weebly.com", "wixsite.com", "firebaseapp.com", "web.app", "github.io",
    "netlify.app", "pages.dev", "blogspot.com", "glitch.me", "herokuapp.com", "vercel.app",
];

const PAYLOAD_EXTENSIONS: &[&str] = &[
    ".exe", ".scr", ".js", ".vbs", ".bat", ".cmd", ".msi", ".jar", ".apk", ".ps1", ".hta",
    ".iso", ".lnk", ".dll",
];

/// Brand keyword and the domains it legitimately lives on.
const BRANDS: &[(&str, &[&str])] = &[
    ("paypal", &["paypal.com", "paypal.me"]),
    ("apple", &["apple.com", "icloud.com"]),
    ("microsoft", &["microsoft.com", "live.com", "office.com"]),
    ("office365", &["office.com", "microsoft.com"]),
    ("amazon", &["amazon.com", "amazon.co.uk", "amazon.de"]),
    ("google", &["google.com", "gmail.com"]),
    ("netflix", &["netflix.com"]),
    ("facebook", &["facebook.com", "fb.com"]),
    ("instagram", &["instagram.com"]),
    ("linkedin", &["linkedin.com"]),
    ("chase", &["chase.com"]),
    ("wellsfargo", &["wellsfargo.com"]),
    ("dhl", &["dhl.com", "dhl.de"]),
    ("fedex", &["fedex.com"]),
    ("docusign", &["docusign.com", "docusign.net"]),
    ("dropbox", &["dropbox.com"]),
];

static CREDENTIAL_TERMS: Lazy<AhoCorasick> = Lazy::new(|| {
    keyword_automaton(&[
        "login", "log in", "sign in", "signin", "verify your account", "password",
        "update your account", "confirm your identity", "account suspended", "webscr",
        "wp-login",
    ])
});

static URGENCY_TERMS: Lazy<AhoCorasick> = Lazy::new(|| {
    keyword_automaton(&[
        "urgent", "immediately", "within 24 hours", "act now", "will be closed",
        "final notice", "expires today", "suspended", "limited time",
    ])
});

static PRIZE_TERMS: Lazy<AhoCorasick> = Lazy::new(|| {
    keyword_automaton(&[
        "you have won", "you've won", "winner", "claim your prize", "gift card", "free iphone",
        "congratulations", "claim your reward",
    ])
});

static SENSITIVE_DATA: Lazy<Regex> = Lazy::new(|| {
    literal_regex(
        r"(?i)\b(social security|ssn|credit card|card number|cvv|bank account|routing number|date of birth|pin code|maiden name)\b",
    )
});

static AUTHORITY: Lazy<Regex> = Lazy::new(|| {
    literal_regex(
        r"(?i)\b(irs|internal revenue|hmrc|police|fbi|tax refund|court notice|it department|security team|customs office)\b",
    )
});

static OBFUSCATION: Lazy<Regex> =
    Lazy::new(|| literal_regex(r"(?i)(%[0-9a-f]{2}){3,}|\\x[0-9a-f]{2}|&#x?[0-9a-f]+;"));

static OPEN_REDIRECT: Lazy<Regex> = Lazy::new(|| {
    literal_regex(
        r"(?i)[?&](url|redirect|redirect_uri|next|return|returnurl|goto|dest|destination|continue)=(https?(:|%3a)|//|%2f%2f)",
    )
});

fn keyword_automaton(terms: &[&str]) -> AhoCorasick {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostFirst)
        .build(terms)
        .unwrap_or_else(|err| unreachable!("keyword lists are literals: {err}"))
}

fn literal_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| unreachable!("check patterns are literals: {err}"))
}

/// Built-in evaluator covering the default catalog checks. Checks it does not
/// know never fire.
#[derive(Debug, Default, Clone)]
pub struct LexicalCheckEvaluator;

impl LexicalCheckEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of [`CheckEvaluator::evaluate`].
    pub fn evaluate_now(&self, check_id: &str, target: &ScanTarget) -> Option<String> {
        let urls = target.urls();
        let text = target.value.as_str();
        match check_id {
            "ip_address_host" => first_url(&urls, |url| {
                url.ip_host().map(|ip| format!("host is the address {ip}"))
            }),
            "excessive_subdomains" => first_url(&urls, |url| {
                let labels = url.labels().len();
                (labels > MAX_HOST_LABELS).then(|| format!("{} has {labels} labels", url.host))
            }),
            "long_url" => first_url(&urls, |url| {
                let len = url.raw.chars().count();
                (len > LONG_URL_CHARS).then(|| format!("URL is {len} characters long"))
            }),
            "at_symbol_in_url" => first_url(&urls, |url| {
                url.userinfo
                    .as_ref()
                    .map(|user| format!("userinfo `{user}` precedes the host"))
            }),
            "punycode_domain" => first_url(&urls, |url| {
                url.labels()
                    .iter()
                    .find(|label| label.starts_with("xn--"))
                    .map(|label| format!("punycode label `{label}`"))
            }),
            "suspicious_tld" => first_url(&urls, |url| {
                url.tld()
                    .filter(|tld| SUSPICIOUS_TLDS.contains(tld))
                    .map(|tld| format!("abused TLD .{tld}"))
            }),
            "url_shortener" => first_url(&urls, |url| {
                SHORTENERS
                    .iter()
                    .find(|host| url.host == **host)
                    .map(|host| format!("shortener {host}"))
            }),
            "free_hosting" => first_url(&urls, |url| {
                FREE_HOSTING
                    .iter()
                    .find(|suffix| host_matches(&url.host, suffix))
                    .map(|suffix| format!("hosted on {suffix}"))
            }),
            "insecure_scheme" => {
                first_url(&urls, |url| (url.scheme == "http").then(|| "plain http".to_string()))
            }
            "credential_keywords" => keyword_hit(&CREDENTIAL_TERMS, text),
            "sensitive_data_request" => regex_hit(&SENSITIVE_DATA, text),
            "brand_keyword_in_subdomain" => first_url(&urls, brand_outside_domain),
            "obfuscated_url" => first_url(&urls, |url| {
                if matches!(url.scheme.as_str(), "javascript" | "data" | "vbscript") {
                    return Some(format!("{}: URL", url.scheme));
                }
                OBFUSCATION
                    .find(&url.raw)
                    .map(|m| format!("encoded sequence `{}`", m.as_str()))
            }),
            "suspicious_file_extension" => payload_extension(target, &urls),
            "open_redirect_param" => first_url(&urls, |url| {
                OPEN_REDIRECT
                    .find(&url.path_and_query)
                    .map(|m| format!("redirect parameter `{}`", m.as_str()))
            }),
            "urgency_language" => keyword_hit(&URGENCY_TERMS, text),
            "prize_lure" => keyword_hit(&PRIZE_TERMS, text),
            "impersonated_authority" => regex_hit(&AUTHORITY, text),
            "brand_infrastructure" => brand_infrastructure(target, &urls),
            "form_origin" => form_origin(target, &urls),
            "homoglyph_domain" => first_url(&urls, homoglyph_lookalike),
            other => {
                trace!(check_id = other, "no lexical rule for check");
                None
            }
        }
    }
}

#[async_trait]
impl CheckEvaluator for LexicalCheckEvaluator {
    async fn evaluate(&self, check: &Check, target: &ScanTarget) -> Result<Option<String>> {
        Ok(self.evaluate_now(&check.id, target))
    }
}

fn first_url(urls: &[UrlParts], probe: impl Fn(&UrlParts) -> Option<String>) -> Option<String> {
    urls.iter().find_map(probe)
}

fn keyword_hit(automaton: &AhoCorasick, text: &str) -> Option<String> {
    automaton
        .find(text)
        .map(|m| format!("phrase `{}`", &text[m.start()..m.end()]))
}

fn regex_hit(regex: &Regex, text: &str) -> Option<String> {
    regex.find(text).map(|m| format!("phrase `{}`", m.as_str()))
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn official_domains(brand: &str) -> Option<&'static [&'static str]> {
    let brand = brand.trim().to_ascii_lowercase().replace([' ', '-'], "");
    BRANDS
        .iter()
        .find(|(name, _)| *name == brand)
        .map(|(_, domains)| *domains)
}

fn on_official_domain(host: &str, domains: &[&str]) -> bool {
    domains.iter().any(|domain| host_matches(host, domain))
}

fn brand_outside_domain(url: &UrlParts) -> Option<String> {
    BRANDS.iter().find_map(|(brand, domains)| {
        (url.host.contains(brand) && !on_official_domain(&url.host, domains))
            .then(|| format!("`{brand}` appears in {}", url.host))
    })
}

fn payload_extension(target: &ScanTarget, urls: &[UrlParts]) -> Option<String> {
    let ends_with_payload = |name: &str| {
        let lower = name.to_ascii_lowercase();
        PAYLOAD_EXTENSIONS
            .iter()
            .find(|ext| lower.ends_with(*ext))
            .map(|ext| format!("`{name}` ends in {ext}"))
    };
    match target.kind {
        TargetKind::File => ends_with_payload(target.value.trim()),
        _ => urls.iter().find_map(|url| ends_with_payload(url.path())),
    }
}

fn brand_infrastructure(target: &ScanTarget, urls: &[UrlParts]) -> Option<String> {
    let brand = target.claimed_brand.as_deref()?;
    let normalized = brand.trim().to_ascii_lowercase().replace([' ', '-'], "");
    urls.iter().find_map(|url| {
        if url.host.is_empty() {
            return None;
        }
        let legitimate = match official_domains(brand) {
            Some(domains) => on_official_domain(&url.host, domains),
            None => url.registrable_domain().contains(&normalized),
        };
        (!legitimate).then(|| format!("claims `{brand}` but is served from {}", url.host))
    })
}

fn form_origin(target: &ScanTarget, urls: &[UrlParts]) -> Option<String> {
    let page_domains: Vec<String> = urls.iter().map(UrlParts::registrable_domain).collect();
    target.form_actions.iter().find_map(|action| {
        let action = action.trim();
        if action.is_empty() || action.starts_with('/') || action.starts_with('#') {
            return None;
        }
        let parsed = UrlParts::parse(action)?;
        if parsed.scheme == "mailto" {
            return Some(format!("form submits by mail to `{action}`"));
        }
        if parsed.scheme == "http" {
            return Some(format!("form posts over plain http to {}", parsed.host));
        }
        let domain = parsed.registrable_domain();
        (!page_domains.is_empty() && !page_domains.contains(&domain))
            .then(|| format!("form posts to foreign origin {}", parsed.host))
    })
}

static CONFUSABLES: Lazy<BTreeMap<char, char>> = Lazy::new(|| {
    [
        ('0', 'o'),
        ('1', 'l'),
        ('3', 'e'),
        ('5', 's'),
        ('4', 'a'),
        ('а', 'a'),
        ('е', 'e'),
        ('о', 'o'),
        ('р', 'p'),
        ('с', 'c'),
        ('х', 'x'),
        ('і', 'i'),
        ('ӏ', 'l'),
    ]
    .into_iter()
    .collect()
});

/// Fold digits and Cyrillic lookalikes onto Latin letters.
fn skeleton(host: &str) -> String {
    let folded: String = host
        .chars()
        .map(|c| CONFUSABLES.get(&c).copied().unwrap_or(c))
        .collect();
    folded.replace("rn", "m").replace("vv", "w")
}

fn homoglyph_lookalike(url: &UrlParts) -> Option<String> {
    let folded = skeleton(&url.host);
    BRANDS.iter().find_map(|(brand, domains)| {
        let lookalike = folded.contains(brand) && !url.host.contains(brand);
        (lookalike && !on_official_domain(&url.host, domains))
            .then(|| format!("{} reads as `{brand}`", url.host))
    })
}
