use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use scan_engine_core::{
    config::{validate, validate_references},
    pipeline::CalibrationRequest,
    render_flow, render_report, AdminApi, AiSettings, ApiError, ChatCompletionJudge,
    ConfigurationDraft, EngineSettings, IndicatorFeed, OutputFormat, ScanEngine, ScanTarget,
    ScanVerdict, TargetKind, ValidationError, MAX_CATEGORY_SCORE, MAX_TI_SCORE,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "scan-engine",
    author,
    version,
    about = "Weighted phishing and malware scan scoring engine"
)]
struct Cli {
    /// Engine settings file (TOML, YAML or JSON); SCAN_ENGINE_* variables override it
    #[arg(long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show score budgets, risk levels and the reference catalog
    Schema {
        #[arg(long)]
        json: bool,
    },
    /// List the built-in configuration presets
    Presets {
        #[arg(long)]
        json: bool,
    },
    /// Check a configuration draft (JSON, JSON5 or YAML) against the score budgets
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Score a URL, message or file name under the active configuration
    Scan {
        #[arg(value_name = "TARGET")]
        target: String,
        #[arg(long, value_enum, default_value_t = KindArg::Url)]
        kind: KindArg,
        /// Static threat intelligence feed (JSON or JSON5)
        #[arg(long, value_name = "FILE")]
        feed: Option<PathBuf>,
        /// Address the target host resolved to; repeatable
        #[arg(long = "resolved", value_name = "IP")]
        resolved: Vec<IpAddr>,
        /// Action URL of a form on the page; repeatable
        #[arg(long = "form-action", value_name = "URL")]
        form_actions: Vec<String>,
        /// Brand the page claims to represent
        #[arg(long, value_name = "NAME")]
        brand: Option<String>,
        /// Emit the report as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
    /// Dry-run a URL and print the stage-by-stage trace without counting usage
    Calibrate {
        #[arg(value_name = "URL")]
        url: String,
        #[arg(long, value_name = "FILE")]
        feed: Option<PathBuf>,
        /// Configuration to score with instead of the active one
        #[arg(long = "configuration", value_name = "ID")]
        configuration_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Send one request to the admin API, e.g. `api GET /v2/admin/scan-engine/stats`
    Api {
        #[arg(value_name = "METHOD")]
        method: String,
        #[arg(value_name = "PATH")]
        path: String,
        /// JSON request body
        #[arg(long, value_name = "JSON")]
        body: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Url,
    Message,
    File,
}

impl From<KindArg> for TargetKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Url => TargetKind::Url,
            KindArg::Message => TargetKind::Message,
            KindArg::File => TargetKind::File,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = EngineSettings::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Schema { json } => schema(settings, json)?,
        Commands::Presets { json } => presets(settings, json)?,
        Commands::Validate { file } => validate_file(settings, &file)?,
        Commands::Scan {
            target,
            kind,
            feed,
            resolved,
            form_actions,
            brand,
            json,
        } => {
            let mut target = ScanTarget::new(kind.into(), target);
            target.resolved_addresses = resolved;
            target.form_actions = form_actions;
            target.claimed_brand = brand;
            scan(settings, target, feed.as_deref(), json).await?
        }
        Commands::Calibrate {
            url,
            feed,
            configuration_id,
            json,
        } => {
            let request = CalibrationRequest {
                url,
                configuration_id,
                test_mode: true,
                resolved_addresses: Vec::new(),
                form_actions: Vec::new(),
                claimed_brand: None,
            };
            calibrate(settings, request, feed.as_deref(), json).await?
        }
        Commands::Api { method, path, body } => api(settings, &method, &path, body.as_deref()).await?,
    }
    Ok(())
}

/// Default engine plus an optional indicator feed and, when credentials are
/// present in the environment, the chat-completion judge.
fn build_engine(settings: EngineSettings, feed: Option<&Path>) -> Result<ScanEngine> {
    let mut engine = ScanEngine::with_defaults(settings)?;
    if let Some(path) = feed {
        let feed = IndicatorFeed::from_path(path)?;
        info!(indicators = feed.len(), path = %path.display(), "loaded indicator feed");
        engine = engine.with_threat_intel(Arc::new(feed));
    }
    match AiSettings::from_env() {
        Ok(ai) => {
            let judge = ChatCompletionJudge::new(&ai)?;
            let catalog = engine.catalog();
            for mut model in catalog.list_models() {
                let id = model.id.clone();
                model.credential_present = true;
                catalog.update_model(&id, model)?;
            }
            engine = engine.with_judge(Arc::new(judge));
        }
        Err(err) => info!("AI consensus disabled: {err:#}"),
    }
    Ok(engine)
}

fn schema(settings: EngineSettings, json: bool) -> Result<()> {
    let api = AdminApi::new(Arc::new(build_engine(settings, None)?));
    let schema = api.schema();
    if json {
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    println!(
        "Budgets: categories {} • TI {} • total {} • per check {}",
        schema.max_category_score,
        schema.max_ti_score,
        schema.max_total_score,
        schema.max_check_weight
    );
    let thresholds: Vec<String> = schema
        .risk_thresholds
        .iter()
        .map(|(level, min)| format!("{level} ≥ {min}"))
        .collect();
    println!("Risk levels: {}", thresholds.join(", "));
    println!("\nCategories:");
    for category in &schema.categories {
        let checks: Vec<&str> = schema
            .checks
            .iter()
            .filter(|check| check.category_id == category.id)
            .map(|check| check.id.as_str())
            .collect();
        println!(
            "- {id:<20} weight {weight:>3} :: {checks}",
            id = category.id,
            weight = category.default_weight,
            checks = checks.join(", ")
        );
    }
    println!("\nThreat intelligence sources:");
    for source in &schema.ti_sources {
        println!(
            "- {id:<20} weight {weight:>3} :: priority {priority}, reliability {reliability:.2}",
            id = source.id,
            weight = source.default_points,
            priority = source.priority,
            reliability = source.reliability
        );
    }
    Ok(())
}

fn presets(settings: EngineSettings, json: bool) -> Result<()> {
    let api = AdminApi::new(Arc::new(build_engine(settings, None)?));
    let mut presets = api.list_presets();
    presets.sort_by(|a, b| a.id.cmp(&b.id));
    if json {
        println!("{}", serde_json::to_string_pretty(&presets)?);
        return Ok(());
    }

    println!("{} preset(s) available", presets.len());
    for preset in presets {
        println!(
            "- {id:<12} categories {categories:>3}/{max_c} • TI {ti:>2}/{max_t} :: {desc}",
            id = preset.id,
            categories = preset.template.category_total(),
            max_c = MAX_CATEGORY_SCORE,
            ti = preset.template.ti_total(),
            max_t = MAX_TI_SCORE,
            desc = preset.description
        );
    }
    Ok(())
}

fn read_draft(path: &Path) -> Result<ConfigurationDraft> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration draft {}", path.display()))?;
    let draft = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML in {}", path.display()))?,
        Some("json5") => json5::from_str(&raw)
            .with_context(|| format!("invalid JSON5 in {}", path.display()))?,
        _ => serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))?,
    };
    Ok(draft)
}

fn validate_file(settings: EngineSettings, path: &Path) -> Result<()> {
    let draft = read_draft(path)?;
    let engine = build_engine(settings, None)?;
    let catalog = engine.catalog().snapshot();
    let outcome = if draft.name.trim().is_empty() {
        Err(ValidationError::Blank {
            field: "name".into(),
        })
    } else {
        validate(&draft.policy).and_then(|()| validate_references(&draft.policy, &catalog))
    };

    if let Err(err) = outcome {
        let body = ApiError::from(err);
        println!("{}", serde_json::to_string_pretty(&body)?);
        bail!("{} is invalid: {}", path.display(), body.message);
    }
    println!(
        "{} {} is valid: {}/{} category points, {}/{} TI points",
        "ok".green().bold(),
        draft.name,
        draft.policy.category_total(),
        MAX_CATEGORY_SCORE,
        draft.policy.ti_total(),
        MAX_TI_SCORE
    );
    Ok(())
}

async fn scan(settings: EngineSettings, target: ScanTarget, feed: Option<&Path>, json: bool) -> Result<()> {
    let engine = build_engine(settings, feed)?;
    let cancel = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };
    let result = engine.scan_with_cancel(target, cancel).await?;
    if json {
        println!("{}", render_report(&result, OutputFormat::Json)?);
        return Ok(());
    }

    let banner = match result.verdict {
        ScanVerdict::Allow => "ALLOW".green().bold(),
        ScanVerdict::Warn => "WARN".yellow().bold(),
        ScanVerdict::Block => "BLOCK".red().bold(),
    };
    println!("{banner}");
    print!("{}", render_report(&result, OutputFormat::Human)?);
    Ok(())
}

async fn calibrate(
    settings: EngineSettings,
    request: CalibrationRequest,
    feed: Option<&Path>,
    json: bool,
) -> Result<()> {
    let engine = build_engine(settings, feed)?;
    let calibration = engine.calibrate(request).await?;
    let format = if json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    println!("{}", render_flow(&calibration, format)?);
    Ok(())
}

async fn api(settings: EngineSettings, method: &str, path: &str, body: Option<&str>) -> Result<()> {
    let api = AdminApi::new(Arc::new(build_engine(settings, None)?));
    let response = api.dispatch(method, path, body).await;
    if !response.body.is_null() {
        println!("{}", serde_json::to_string_pretty(&response.body)?);
    }
    if !response.is_success() {
        bail!("{method} {path} answered {}", response.status);
    }
    Ok(())
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
