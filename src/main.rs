use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use url::Url;

use hunt_relay::agent::CaptureAgent;
use hunt_relay::backend::{Backend, HttpBackend, LocalBackend};
use hunt_relay::config::Config;
use hunt_relay::db::Database;
use hunt_relay::extract::{fetch_page, FieldExtractor};
use hunt_relay::ingress::IngressListener;
use hunt_relay::models::{ApplicationStatus, CapturedRecord, Document, DocumentPatch};
use hunt_relay::protocol::{CaptureRequest, CaptureResponse};
use hunt_relay::reconcile::CacheReconciler;
use hunt_relay::relay::{parse_origins, TabRelay};
use hunt_relay::store::{MemoryStore, SqliteStore};
use hunt_relay::tabs::{AppContext, InProcessTabHost, TabHost};
use hunt_relay::webdriver::WebDriverTabHost;

#[derive(Parser)]
#[command(name = "hunt-relay")]
#[command(about = "Deliver captured job applications to your tracker, falling back to open app tabs")]
struct Cli {
    /// Backend base URL (overrides config and HUNT_BACKEND_URL)
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Use the local SQLite backend instead of the HTTP one
    #[arg(long, global = true)]
    local: bool,

    /// WebDriver server whose browser windows the relay may reach
    #[arg(long, global = true)]
    webdriver: Option<String>,

    /// Directory for data files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the local databases
    Init,

    /// Capture a job application and deliver it
    Capture {
        /// Job page to fetch and extract fields from
        #[arg(long)]
        url: Option<String>,

        /// Saved HTML of the job page
        #[arg(long)]
        html: Option<PathBuf>,

        #[arg(short, long)]
        company: Option<String>,

        #[arg(short, long)]
        position: Option<String>,

        #[arg(short, long)]
        location: Option<String>,

        #[arg(short, long)]
        salary: Option<String>,

        /// Job URL recorded with the application
        #[arg(long)]
        job_url: Option<String>,

        #[arg(short, long)]
        notes: Option<String>,

        /// Status (applied, interviewing, offered, rejected, withdrawn)
        #[arg(long)]
        status: Option<String>,
    },

    /// Read a saveJobData request from stdin and print the response
    Request,

    /// Manage resumes through the cache
    Resume {
        #[command(subcommand)]
        command: ResumeCommands,
    },

    /// List captured applications
    Applications {
        /// Read the local backend's store instead of the cache
        #[arg(long)]
        stored: bool,
    },

    /// Run the backend-down relay scenario in-process
    Simulate,
}

#[derive(Subcommand)]
enum ResumeCommands {
    /// List resumes
    List {
        /// Only resumes owned by this user
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Show a resume as JSON
    Show {
        id: String,
    },

    /// Create a resume from a JSON file
    Create {
        file: PathBuf,
    },

    /// Apply a partial JSON document to a resume
    Update {
        id: String,
        file: PathBuf,
    },

    /// Delete a resume
    Delete {
        id: String,
    },
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hunt_relay=info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_backend(config: &Config, local: bool) -> Result<Arc<dyn Backend>> {
    if local {
        let db = Database::open(&config.backend_db_path())?;
        db.ensure_initialized()?;
        return Ok(Arc::new(LocalBackend::new(db)));
    }
    Ok(Arc::new(HttpBackend::new(&config.backend_url, config.primary_timeout())?))
}

fn open_cache(config: &Config, backend: Arc<dyn Backend>) -> Result<CacheReconciler> {
    let store = SqliteStore::open(&config.cache_db_path())?;
    Ok(CacheReconciler::new(backend, Arc::new(store), config.primary_timeout()))
}

async fn build_agent(config: &Config, backend: Arc<dyn Backend>) -> Result<CaptureAgent> {
    let host: Arc<dyn TabHost> = match &config.webdriver_url {
        Some(url) => Arc::new(WebDriverTabHost::connect(url).await?),
        None => Arc::new(InProcessTabHost::new()),
    };
    let relay = TabRelay::new(host, config.origins(), config.relay_timeout());
    Ok(CaptureAgent::new(backend, relay, config.primary_timeout()))
}

fn read_patch(path: &Path) -> Result<DocumentPatch> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid resume JSON in {}", path.display()))
}

fn print_response(response: &CaptureResponse) {
    if response.success {
        match &response.message {
            Some(message) => println!("Delivered ({}).", message),
            None => println!("Delivered to backend."),
        }
    } else if response.duplicate {
        println!(
            "Already tracked: {}",
            response.error.as_deref().unwrap_or("duplicate application")
        );
    } else {
        println!(
            "Delivery failed: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn print_documents(docs: &[Document]) {
    if docs.is_empty() {
        println!("No resumes found.");
        return;
    }
    println!("{:<28} {:<30} {:<20} {:>6} {:<6}", "ID", "TITLE", "NAME", "SKILLS", "SYNCED");
    println!("{}", "-".repeat(94));
    for doc in docs {
        let name = doc
            .personal_info
            .as_ref()
            .and_then(|info| info.display_name())
            .unwrap_or_default();
        println!(
            "{:<28} {:<30} {:<20} {:>6} {:<6}",
            truncate(&doc.id, 26),
            truncate(&doc.title, 28),
            truncate(&name, 18),
            doc.skills.len(),
            if doc.is_local() { "no" } else { "yes" }
        );
    }
}

fn print_applications(records: &[CapturedRecord]) {
    if records.is_empty() {
        println!("No applications found.");
        return;
    }
    println!("{:<14} {:<25} {:<30} {:<30}", "STATUS", "COMPANY", "POSITION", "URL");
    println!("{}", "-".repeat(100));
    for record in records {
        println!(
            "{:<14} {:<25} {:<30} {:<30}",
            record.status,
            truncate(&record.company, 23),
            truncate(&record.position, 28),
            truncate(record.job_url.as_deref().unwrap_or("-"), 28)
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(url) = cli.backend_url {
        config.backend_url = url;
    }
    if let Some(url) = cli.webdriver {
        config.webdriver_url = Some(url);
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }

    match cli.command {
        Commands::Init => {
            for path in [config.backend_db_path(), config.cache_db_path()] {
                let db = Database::open(&path)?;
                db.init()?;
                println!("Database initialized at {}", db.path().display());
            }
        }

        Commands::Capture {
            url,
            html,
            company,
            position,
            location,
            salary,
            job_url,
            notes,
            status,
        } => {
            let extractor = FieldExtractor::new();
            let mut record = match (&html, &url) {
                (Some(path), _) => {
                    let page = std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    extractor.extract(&page, url.as_deref())
                }
                (None, Some(url)) => {
                    let page = fetch_page(url).await?;
                    extractor.extract(&page, Some(url.as_str()))
                }
                (None, None) => CapturedRecord::default(),
            };

            if let Some(company) = company {
                record.company = company;
            }
            if let Some(position) = position {
                record.position = position;
            }
            if location.is_some() {
                record.location = location;
            }
            if salary.is_some() {
                record.salary = salary;
            }
            if job_url.is_some() {
                record.job_url = job_url;
            }
            if notes.is_some() {
                record.notes = notes;
            }
            if let Some(status) = status {
                record.status = status.parse::<ApplicationStatus>()?;
            }
            record.applied_date = Some(chrono::Local::now().date_naive());

            if record.company.trim().is_empty() || record.position.trim().is_empty() {
                return Err(anyhow!(
                    "Could not determine company and position. Pass --company and --position."
                ));
            }

            println!("Company:  {}", record.company);
            println!("Position: {}", record.position);
            if let Some(url) = &record.job_url {
                println!("URL:      {}", url);
            }

            let backend = open_backend(&config, cli.local)?;
            let agent = build_agent(&config, backend).await?;
            let response = agent
                .handle(CaptureRequest::SaveJobData { job_data: record })
                .await;
            print_response(&response);
        }

        Commands::Request => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read request from stdin")?;
            let response = match serde_json::from_str::<CaptureRequest>(&input) {
                Ok(request) => {
                    let backend = open_backend(&config, cli.local)?;
                    build_agent(&config, backend).await?.handle(request).await
                }
                Err(e) => CaptureResponse::failed(format!("invalid request: {}", e)),
            };
            println!("{}", serde_json::to_string(&response)?);
        }

        Commands::Resume { command } => {
            let backend = open_backend(&config, cli.local)?;
            let cache = open_cache(&config, backend)?;
            match command {
                ResumeCommands::List { user } => {
                    let docs = cache.list(user.as_deref()).await;
                    print_documents(&docs);
                }

                ResumeCommands::Show { id } => match cache.get(&id).await {
                    Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                    None => println!("Resume '{}' not found.", id),
                },

                ResumeCommands::Create { file } => {
                    let doc = cache.create(read_patch(&file)?).await?;
                    if doc.is_local() {
                        println!("Backend unreachable; saved resume '{}' locally as {}.", doc.title, doc.id);
                    } else {
                        println!("Created resume '{}' ({}).", doc.title, doc.id);
                    }
                }

                ResumeCommands::Update { id, file } => {
                    let doc = cache.update(&id, read_patch(&file)?).await?;
                    println!("Updated resume '{}' ({}).", doc.title, doc.id);
                }

                ResumeCommands::Delete { id } => {
                    cache.delete(&id).await?;
                    println!("Deleted resume {}.", id);
                }
            }
        }

        Commands::Applications { stored } => {
            if stored {
                let db = Database::open(&config.backend_db_path())?;
                db.ensure_initialized()?;
                let applications = db.list_applications()?;
                if applications.is_empty() {
                    println!("No applications found.");
                } else {
                    println!(
                        "{:<6} {:<25} {:<30} {:<20} {:<20}",
                        "ID", "COMPANY", "POSITION", "APPLIED", "STORED"
                    );
                    println!("{}", "-".repeat(105));
                    for app in applications {
                        println!(
                            "{:<6} {:<25} {:<30} {:<20} {:<20}",
                            app.id,
                            truncate(&app.record.company, 23),
                            truncate(&app.record.position, 28),
                            truncate(&app.applied_at, 19),
                            truncate(&app.created_at, 19)
                        );
                    }
                }
            } else {
                let backend = open_backend(&config, cli.local)?;
                let cache = open_cache(&config, backend)?;
                print_applications(&cache.applications());
            }
        }

        Commands::Simulate => simulate(&config).await?,
    }

    Ok(())
}

/// Capture with the backend unreachable and one application tab open, let
/// the tab forward the record, then capture the same job again.
async fn simulate(config: &Config) -> Result<()> {
    let app_url = Url::parse("http://localhost:3000/dashboard")?;
    let origins = parse_origins(&[app_url.to_string()]);

    let store_backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(Database::open_in_memory()?));
    // Nothing listens on the discard port.
    let unreachable: Arc<dyn Backend> =
        Arc::new(HttpBackend::new("http://127.0.0.1:9", Duration::from_secs(2))?);

    let tab = AppContext::new("app-1", app_url, Arc::new(MemoryStore::new()));
    let cache = Arc::new(CacheReconciler::new(
        store_backend.clone(),
        tab.store().clone(),
        config.primary_timeout(),
    ));
    let listener = IngressListener::new(store_backend.clone(), cache.clone(), config.primary_timeout());
    let worker = listener.attach(tab.clone());

    let host = Arc::new(InProcessTabHost::new());
    host.open(tab.clone());

    let mut record = CapturedRecord::new("Acme", "Engineer");
    record.job_url = Some("https://x/1".to_string());

    println!("1. Backend down, one application tab open");
    let agent = CaptureAgent::new(
        unreachable,
        TabRelay::new(host.clone(), origins.clone(), config.relay_timeout()),
        config.primary_timeout(),
    );
    let response = agent
        .handle(CaptureRequest::SaveJobData { job_data: record.clone() })
        .await;
    print_response(&response);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while cache.applications().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    println!("2. Tab forwarded the record; cached applications:");
    print_applications(&cache.applications());

    println!("3. Backend reachable again, same job captured a second time");
    let agent = CaptureAgent::new(
        store_backend,
        TabRelay::new(host, origins, config.relay_timeout()),
        config.primary_timeout(),
    );
    let response = agent
        .handle(CaptureRequest::SaveJobData { job_data: record })
        .await;
    print_response(&response);

    tab.unregister_listener();
    if let Err(e) = worker.await {
        warn!(error = %e, "ingress listener ended abnormally");
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
