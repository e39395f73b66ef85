//! Site Panel CLI
//!
//! The `sitepanel` command renders persona prompts for candidate sites and
//! runs the five-persona review against a chat-completions endpoint.
//!
//! ## Commands
//!
//! - `roles`: List registered roles and the registry fingerprint
//! - `render`: Print rendered persona prompts for one site
//! - `evaluate`: Run the two-phase review for every site in a file
//! - `report`: Write the Markdown (and optionally CSV) dialogue summary

mod chat;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use sitepanel_core::{
    install_global, load_evaluations, load_sites, write_dialogue_summary_csv,
    write_dialogue_summary_md, write_evaluation_json, write_failures_json, OpinionDispatcher, Orchestrator, PanelConfig,
    PersonaRole, RenderRequest, RetryingDispatcher, RoleRegistry, SiteAttributes,
    SUMMARY_ROLE_ID,
};

use crate::chat::{ChatCompletionsDispatcher, DryRunDispatcher};

const DEFAULT_CONFIG_FILE: &str = "sitepanel.toml";

#[derive(Parser)]
#[command(name = "sitepanel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Persona review panel for candidate archaeological sites", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: ./sitepanel.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Role definitions JSON, overrides the configured registry
    #[arg(long, global = true)]
    roles: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered roles with their placeholders
    Roles,

    /// Print rendered persona prompts for a site without dispatching them
    Render {
        /// Site attributes JSON (array of sites)
        #[arg(long)]
        sites: PathBuf,

        /// Site to render (default: the first site)
        #[arg(long)]
        site_id: Option<String>,

        /// Render a single persona only
        #[arg(long)]
        role: Option<String>,
    },

    /// Run the persona review for every site
    Evaluate {
        /// Site attributes JSON (array of sites)
        #[arg(long)]
        sites: PathBuf,

        /// Directory for per-site results
        #[arg(long)]
        output_dir: PathBuf,

        /// Completion token limit per request
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Base sampling temperature
        #[arg(long)]
        temperature: Option<f32>,

        /// Chat model name
        #[arg(long)]
        model: Option<String>,

        /// Answer offline with deterministic placeholder opinions
        #[arg(long)]
        dry_run: bool,
    },

    /// Write the dialogue summary as Markdown, plus a CSV table if asked
    Report {
        /// Directory holding per-site results
        #[arg(long)]
        input_dir: PathBuf,

        /// Markdown file to write
        #[arg(long)]
        output_md: PathBuf,

        /// CSV table to write alongside the Markdown
        #[arg(long)]
        output_csv: Option<PathBuf>,

        /// Value of the CSV `version` column
        #[arg(long, default_value = sitepanel_core::report::DEFAULT_VERSION_LABEL)]
        version_label: String,

        /// Truncate opinions to this many characters
        #[arg(long, default_value_t = 120)]
        max_len: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    sitepanel_core::init_tracing(cli.json, level);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(roles) = cli.roles {
        config.roles_path = Some(roles);
    }

    match cli.command {
        Commands::Roles => {
            let registry = install_registry(&config)?;
            cmd_roles(&registry)
        }
        Commands::Render {
            sites,
            site_id,
            role,
        } => {
            let registry = install_registry(&config)?;
            cmd_render(registry, &config, &sites, site_id.as_deref(), role.as_deref())
        }
        Commands::Evaluate {
            sites,
            output_dir,
            max_tokens,
            temperature,
            model,
            dry_run,
        } => {
            if let Some(max_tokens) = max_tokens {
                config.chat.max_tokens = max_tokens;
            }
            if let Some(temperature) = temperature {
                config.orchestrator.base_temperature = temperature;
            }
            if let Some(model) = model {
                config.chat.model = model;
            }
            let registry = install_registry(&config)?;
            let dispatcher: Arc<dyn OpinionDispatcher> = if dry_run {
                Arc::new(DryRunDispatcher)
            } else {
                let client = ChatCompletionsDispatcher::from_env(config.chat.clone())?;
                Arc::new(RetryingDispatcher::new(client, config.retry))
            };
            cmd_evaluate(registry, dispatcher, &config, &sites, &output_dir).await
        }
        Commands::Report {
            input_dir,
            output_md,
            output_csv,
            version_label,
            max_len,
        } => cmd_report(
            &input_dir,
            &output_md,
            output_csv.as_deref(),
            &version_label,
            max_len,
        ),
    }
}

fn load_config(path: Option<&Path>) -> Result<PanelConfig> {
    let mut config = match path {
        Some(path) => PanelConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PanelConfig::load_or_default(Path::new(DEFAULT_CONFIG_FILE))
            .context("Failed to load sitepanel.toml")?,
    };
    config
        .apply_env()
        .context("Invalid SITEPANEL_* environment override")?;
    Ok(config)
}

fn install_registry(config: &PanelConfig) -> Result<Arc<RoleRegistry>> {
    let registry = config
        .load_registry()
        .context("Failed to load role registry")?;
    install_global(registry).context("Failed to install role registry")
}

fn cmd_roles(registry: &RoleRegistry) -> Result<()> {
    println!("Registry fingerprint: {}", registry.fingerprint()?);
    println!();
    for id in registry.ids() {
        let role = registry.get(id)?;
        let placeholders: Vec<&str> = role.placeholders().iter().map(String::as_str).collect();
        println!("  {:<10} {{{}}}", id, placeholders.join("}, {"));
    }
    Ok(())
}

fn select_site(sites: Vec<SiteAttributes>, site_id: Option<&str>) -> Result<SiteAttributes> {
    match site_id {
        Some(id) => sites
            .into_iter()
            .find(|site| site.site_id == id)
            .with_context(|| format!("Site '{}' not found", id)),
        None => sites.into_iter().next().context("Sites file is empty"),
    }
}

fn cmd_render(
    registry: Arc<RoleRegistry>,
    config: &PanelConfig,
    sites_path: &Path,
    site_id: Option<&str>,
    role: Option<&str>,
) -> Result<()> {
    let sites = load_sites(sites_path)
        .with_context(|| format!("Failed to read sites from {}", sites_path.display()))?;
    let site = select_site(sites, site_id)?;
    let fields = site.to_fields();

    if let Some(role_id) = role {
        if role_id == SUMMARY_ROLE_ID {
            bail!("The summary prompt needs persona opinions; run `sitepanel evaluate` instead");
        }
        let compiled = registry.get(role_id)?;
        let request = RenderRequest::for_role(compiled, &fields);
        let prompt = registry.render(&request, config.orchestrator.render_policy)?;
        println!("{}", prompt);
        return Ok(());
    }

    let orchestrator = Orchestrator::new(
        registry,
        Arc::new(DryRunDispatcher),
        config.orchestrator.clone(),
    )?;
    for (persona, prompt) in orchestrator.render_personas(&fields)? {
        println!("=== {} ({}) ===", persona, site.site_id);
        println!("{}", prompt);
        println!();
    }
    Ok(())
}

async fn cmd_evaluate(
    registry: Arc<RoleRegistry>,
    dispatcher: Arc<dyn OpinionDispatcher>,
    config: &PanelConfig,
    sites_path: &Path,
    output_dir: &Path,
) -> Result<()> {
    let sites = load_sites(sites_path)
        .with_context(|| format!("Failed to read sites from {}", sites_path.display()))?;
    let orchestrator = Orchestrator::new(registry, dispatcher, config.orchestrator.clone())?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    info!(sites = sites.len(), "evaluating sites");
    println!(
        "Evaluating {} site(s) with {} personas...",
        sites.len(),
        PersonaRole::ALL.len()
    );

    let outcome = orchestrator.evaluate_batch(sites).await;

    for evaluation in &outcome.evaluations {
        let path = write_evaluation_json(output_dir, evaluation)?;
        println!("  ✓ {} → {}", evaluation.site_id(), path.display());
    }
    for failure in &outcome.failures {
        println!("  ✗ {}: {}", failure.site_id, failure.error);
    }

    if !outcome.failures.is_empty() {
        let path = write_failures_json(output_dir, &outcome.failures)?;
        warn!(
            failed = outcome.failures.len(),
            ledger = %path.display(),
            "some sites failed"
        );
        println!("Failed sites recorded in {}", path.display());
    }

    println!(
        "Done: {} succeeded, {} failed",
        outcome.evaluations.len(),
        outcome.failures.len()
    );
    Ok(())
}

fn cmd_report(
    input_dir: &Path,
    output_md: &Path,
    output_csv: Option<&Path>,
    version_label: &str,
    max_len: usize,
) -> Result<()> {
    let evaluations = load_evaluations(input_dir)?;
    if evaluations.is_empty() {
        warn!(dir = %input_dir.display(), "no evaluations found");
    }
    write_dialogue_summary_md(output_md, &evaluations, max_len)?;
    println!(
        "Wrote summary of {} site(s) to {}",
        evaluations.len(),
        output_md.display()
    );
    if let Some(output_csv) = output_csv {
        write_dialogue_summary_csv(output_csv, &evaluations, max_len, version_label)?;
        println!("Wrote CSV table to {}", output_csv.display());
    }
    Ok(())
}
