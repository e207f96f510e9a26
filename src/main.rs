mod analyze;
mod artifacts;
mod clients;
mod collect;
mod config;
mod cycle;
mod db;
mod enrich;
mod filters;
mod models;
mod qualify;
mod sustain;
mod validate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::artifacts::ArtifactStore;
use crate::clients::{AnalysisClient, CrawlClient, ListingClient, ListingProvider};
use crate::config::{FilterStore, ResumeProfile, Settings};
use crate::cycle::{Pipeline, ShutdownFlag};
use crate::db::Database;
use crate::models::FitScore;

#[derive(Parser)]
#[command(name = "prospect")]
#[command(about = "Job application pipeline - discover, qualify, and tailor job postings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and default configuration
    Init,

    /// Run the pipeline
    Run {
        /// Run a single processing cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Show record counts per pipeline stage
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init => init(),
        Commands::Run { once } => run(once),
        Commands::Status => status(),
    }
}

fn init() -> Result<()> {
    dotenvy::dotenv().ok();
    let db = Database::open()?;
    db.init()?;
    println!("Database initialized at {}", db.path().display());

    let filters_path = std::env::var("FILTERS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("filters.yaml"));
    let filter_store = FilterStore::new(filters_path.clone());
    filter_store.ensure_exists()?;
    println!("Filter configuration ready at {}", filters_path.display());
    Ok(())
}

fn run(once: bool) -> Result<()> {
    // Missing critical configuration aborts here, before any cycle starts.
    let settings = Settings::from_env()?;
    let profile = ResumeProfile::load(&settings.resume_profile_path)?;

    let db = Database::open()?;
    db.init()?;
    let filter_store = FilterStore::new(settings.filters_path.clone());
    filter_store.ensure_exists()?;
    let artifact_store = ArtifactStore::open(&settings.data_dir)?;

    let analysis = AnalysisClient::from_env()?;
    let listing = ListingClient::from_env()?;
    let crawler = CrawlClient::from_env()?;

    let shutdown = ShutdownFlag::new();
    {
        let flag = shutdown.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nShutdown signal received. Finishing current operation and exiting...");
            flag.request();
        })
        .context("Failed to install shutdown handler")?;
    }

    info!(
        user = %profile.full_name,
        database = %db.path().display(),
        sustainability = settings.check_sustainability,
        crawl = settings.crawl_enabled,
        "Starting pipeline"
    );
    if !listing.is_available() {
        info!("Listing provider is not configured or unavailable; running with reduced sources");
    }

    let pipeline = Pipeline {
        db: &db,
        listing: &listing,
        analyst: &analysis,
        generator: &analysis,
        crawler: Some(&crawler),
        filter_store: &filter_store,
        artifact_store: &artifact_store,
        profile: &profile,
        settings: &settings,
    };

    if once {
        let mut cache = cycle::build_company_overview_cache(&db)?;
        let outcome = pipeline.run_cycle(&mut cache, &shutdown)?;
        info!(progress = outcome.progress, "Cycle finished");
    } else {
        pipeline.run_loop(&shutdown)?;
    }
    Ok(())
}

fn status() -> Result<()> {
    let db = Database::open()?;
    db.ensure_initialized()?;
    let rows = db.get_all()?;

    let mut applied = 0;
    let mut expired = 0;
    let mut flagged = 0;
    let mut missing_description = 0;
    let mut missing_overview = 0;
    let mut sustainability_pending = 0;
    let mut unscored = 0;
    let mut artifacts_ready = 0;

    for row in &rows {
        if row.applied {
            applied += 1;
        }
        if row.expired {
            expired += 1;
        }
        if row.bad_analysis {
            flagged += 1;
        }
        if row.is_excluded() {
            continue;
        }
        if row.job_description.is_empty() {
            missing_description += 1;
        }
        if row.company_overview.is_empty() {
            missing_overview += 1;
        }
        if row.sustainable.is_none() {
            sustainability_pending += 1;
        }
        if row.fit_score.is_none() {
            unscored += 1;
        }
        if !row.tailored_resume_ref.is_empty() {
            artifacts_ready += 1;
        }
    }

    println!("{:<32} {:>6}", "Total records", rows.len());
    println!("{:<32} {:>6}", "Applied", applied);
    println!("{:<32} {:>6}", "Expired", expired);
    println!("{:<32} {:>6}", "Flagged for re-analysis", flagged);
    println!("{}", "-".repeat(39));
    println!("{:<32} {:>6}", "Missing job description", missing_description);
    println!("{:<32} {:>6}", "Missing company overview", missing_overview);
    println!("{:<32} {:>6}", "Sustainability pending", sustainability_pending);
    println!("{:<32} {:>6}", "Awaiting analysis", unscored);
    println!("{:<32} {:>6}", "Resume ready", artifacts_ready);
    println!("{}", "-".repeat(39));

    for score in [
        FitScore::VeryGoodFit,
        FitScore::GoodFit,
        FitScore::ModerateFit,
        FitScore::QuestionableFit,
        FitScore::PoorFit,
        FitScore::VeryPoorFit,
    ] {
        let count = rows.iter().filter(|r| r.fit_score == Some(score)).count();
        println!("{:<32} {:>6}", score.as_str(), count);
    }

    Ok(())
}
