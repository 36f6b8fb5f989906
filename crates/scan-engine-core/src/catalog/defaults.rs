use std::collections::BTreeMap;

use super::{AiModel, CatalogSnapshot, Category, Check, CheckTier, Severity, TiSource};

// (id, name, description, default weight). Weights sum to MAX_CATEGORY_SCORE.
const CATEGORIES: &[(&str, &str, &str, u32)] = &[
    ("url_structure", "URL Structure", "Lexical shape of the URL itself", 60),
    ("domain_reputation", "Domain Reputation", "TLD, shortener and hosting signals", 70),
    ("ssl_certificate", "Transport Security", "Scheme and certificate posture", 40),
    ("content_analysis", "Content Analysis", "Credential and sensitive-data lures", 80),
    ("brand_impersonation", "Brand Impersonation", "Brand names on foreign infrastructure", 75),
    ("phishing_indicators", "Phishing Indicators", "Obfuscation and payload delivery", 80),
    ("redirect_chain", "Redirects", "Open redirect and chained hops", 35),
    ("form_security", "Form Security", "Where submitted data is sent", 45),
    ("social_engineering", "Social Engineering", "Urgency, prizes and authority pressure", 50),
];

struct CheckSeed {
    id: &'static str,
    category: &'static str,
    name: &'static str,
    severity: Severity,
    points: u32,
    tier: CheckTier,
    manual_review: bool,
}

const fn seed(
    id: &'static str,
    category: &'static str,
    name: &'static str,
    severity: Severity,
    points: u32,
) -> CheckSeed {
    CheckSeed {
        id,
        category,
        name,
        severity,
        points,
        tier: CheckTier::Stage1,
        manual_review: false,
    }
}

const fn deep(
    id: &'static str,
    category: &'static str,
    name: &'static str,
    severity: Severity,
    points: u32,
) -> CheckSeed {
    CheckSeed {
        id,
        category,
        name,
        severity,
        points,
        tier: CheckTier::Stage2,
        manual_review: true,
    }
}

const CHECKS: &[CheckSeed] = &[
    seed("ip_address_host", "url_structure", "Raw IP address host", Severity::High, 25),
    seed("excessive_subdomains", "url_structure", "Excessive subdomain depth", Severity::Medium, 10),
    seed("long_url", "url_structure", "Unusually long URL", Severity::Low, 5),
    seed("at_symbol_in_url", "url_structure", "Userinfo (@) in authority", Severity::Medium, 15),
    seed("punycode_domain", "url_structure", "Punycode host label", Severity::High, 20),
    seed("suspicious_tld", "domain_reputation", "Abused top-level domain", Severity::Medium, 20),
    seed("url_shortener", "domain_reputation", "Link shortener host", Severity::Low, 10),
    seed("free_hosting", "domain_reputation", "Free hosting platform", Severity::Medium, 15),
    seed("insecure_scheme", "ssl_certificate", "Plain HTTP transport", Severity::Medium, 20),
    seed("credential_keywords", "content_analysis", "Credential harvesting keywords", Severity::High, 30),
    seed("sensitive_data_request", "content_analysis", "Requests for sensitive data", Severity::High, 30),
    seed("brand_keyword_in_subdomain", "brand_impersonation", "Brand name outside brand domain", Severity::High, 30),
    seed("obfuscated_url", "phishing_indicators", "Encoded or script URL", Severity::High, 25),
    seed("suspicious_file_extension", "phishing_indicators", "Executable payload", Severity::Critical, 40),
    seed("open_redirect_param", "redirect_chain", "Redirect parameter to external URL", Severity::Medium, 20),
    seed("urgency_language", "social_engineering", "Urgency pressure", Severity::Medium, 20),
    seed("prize_lure", "social_engineering", "Prize or giveaway lure", Severity::Medium, 20),
    seed("impersonated_authority", "social_engineering", "Authority impersonation", Severity::Medium, 20),
    deep("brand_infrastructure", "brand_impersonation", "Claimed brand on foreign infrastructure", Severity::Critical, 40),
    deep("form_origin", "form_security", "Form posts to foreign or insecure origin", Severity::High, 35),
    deep("homoglyph_domain", "brand_impersonation", "Homoglyph brand lookalike", Severity::High, 35),
];

pub fn default_categories() -> Vec<Category> {
    CATEGORIES
        .iter()
        .map(|(id, name, description, weight)| Category {
            id: (*id).into(),
            name: (*name).into(),
            description: (*description).into(),
            default_weight: *weight,
        })
        .collect()
}

pub fn default_checks() -> Vec<Check> {
    CHECKS
        .iter()
        .map(|seed| Check {
            id: seed.id.into(),
            category_id: seed.category.into(),
            name: seed.name.into(),
            severity: seed.severity,
            default_points: seed.points,
            enabled: true,
            api_integration: None,
            automation_capable: true,
            requires_manual_review: seed.manual_review,
            tier: seed.tier,
        })
        .collect()
}

pub fn default_sources() -> Vec<TiSource> {
    let source = |id: &str, name: &str, points, key, priority, reliability, endpoint: &str| TiSource {
        id: id.into(),
        name: name.into(),
        default_points: points,
        requires_api_key: key,
        priority,
        reliability,
        enabled: true,
        endpoint: Some(endpoint.into()),
    };
    vec![
        source("phishtank", "PhishTank", 15, false, 1, 0.95, "https://checkurl.phishtank.com/checkurl/"),
        source("urlhaus", "URLhaus", 12, false, 1, 0.9, "https://urlhaus-api.abuse.ch/v1/"),
        source("openphish", "OpenPhish", 10, false, 1, 0.85, "https://openphish.com/feed.txt"),
        source(
            "google_safe_browsing",
            "Google Safe Browsing",
            10,
            true,
            2,
            0.98,
            "https://safebrowsing.googleapis.com/v4/threatMatches:find",
        ),
        source("abuseipdb", "AbuseIPDB", 8, true, 3, 0.8, "https://api.abuseipdb.com/api/v2/check"),
    ]
}

pub fn default_models() -> Vec<AiModel> {
    let model = |id: &str, model_id: &str, name: &str, provider: &str, rank, weight| AiModel {
        id: id.into(),
        model_id: model_id.into(),
        name: name.into(),
        provider: provider.into(),
        rank,
        weight,
        enabled: true,
        credential_present: false,
        endpoint: None,
    };
    vec![
        model("openai-primary", "gpt-4o-mini", "GPT-4o mini", "openai", 1, 0.4),
        model("anthropic-secondary", "claude-3-haiku-20240307", "Claude 3 Haiku", "anthropic", 2, 0.35),
        model("gemini-tertiary", "gemini-1.5-flash", "Gemini 1.5 Flash", "google", 3, 0.25),
    ]
}

pub fn default_catalog() -> CatalogSnapshot {
    CatalogSnapshot {
        categories: by_id(default_categories(), |c| &c.id),
        checks: by_id(default_checks(), |c| &c.id),
        ti_sources: by_id(default_sources(), |s| &s.id),
        ai_models: by_id(default_models(), |m| &m.id),
    }
}

fn by_id<T>(items: Vec<T>, id: impl Fn(&T) -> &String) -> BTreeMap<String, T> {
    items
        .into_iter()
        .map(|item| (id(&item).clone(), item))
        .collect()
}
