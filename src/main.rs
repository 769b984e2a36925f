mod config;
mod crawl;
mod db;
mod fetch;
mod parser;
mod sanitize;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use crate::config::Settings;
use crate::crawl::{CrawlOptions, CrawlReport};
use crate::db::Store;
use crate::fetch::HttpFetcher;

#[derive(Parser)]
#[command(name = "service_scraper", about = "Berlin service directory scraper")]
struct Cli {
    /// Config file (default: ./service_scraper.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database path (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy)]
struct CrawlArgs {
    /// Max listing entries to crawl (default: all)
    #[arg(short = 'n', long)]
    limit: Option<usize>,
    /// Concurrent detail fetches (overrides config)
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the service listing and every service detail page
    CrawlServices(CrawlArgs),
    /// Crawl the location listing and every location detail page
    CrawlLocations(CrawlArgs),
    /// Services, then locations
    Crawl(CrawlArgs),
    /// Search stored services
    Services {
        /// Name substring
        #[arg(short, long)]
        search: Option<String>,
        /// Only services that can (true) or cannot (false) be done online
        #[arg(long)]
        online: Option<bool>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Show one service with its detail, forms and locations
    Service { id: i64 },
    /// Search stored locations
    Locations {
        #[arg(short, long)]
        search: Option<String>,
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Search stored forms
    Forms {
        #[arg(short, long)]
        search: Option<String>,
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Show row counts and recent crawl runs
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    let store = Store::open(&settings.db_path, settings.form_policy)?;
    store.init_schema()?;

    let result = match cli.command {
        Commands::CrawlServices(args) => {
            let (fetcher, opts) = crawl_setup(&settings, args)?;
            println!("Crawling services from {}...", opts.base_url);
            let report = crawl::crawl_services(&store, fetcher, &opts).await?;
            print_report(&report);
            Ok(())
        }
        Commands::CrawlLocations(args) => {
            let (fetcher, opts) = crawl_setup(&settings, args)?;
            println!("Crawling locations from {}...", opts.base_url);
            let report = crawl::crawl_locations(&store, fetcher, &opts).await?;
            print_report(&report);
            Ok(())
        }
        Commands::Crawl(args) => {
            let (fetcher, opts) = crawl_setup(&settings, args)?;
            println!(
                "Pipeline: services, then locations from {} ({} concurrent)...",
                opts.base_url, opts.concurrency
            );
            for report in crawl::crawl_all(&store, fetcher, &opts).await? {
                print_report(&report);
            }
            Ok(())
        }
        Commands::Services { search, online, limit } => {
            let rows = store.find_services(search.as_deref(), online, limit)?;
            if rows.is_empty() {
                println!("No services found.");
                return Ok(());
            }

            println!("{:>8} | {:<60} | {:<6}", "ID", "Service", "Online");
            println!("{}", "-".repeat(80));
            for r in &rows {
                let online = if r.can_be_done_online { "yes" } else { "-" };
                println!("{:>8} | {:<60} | {:<6}", r.id, truncate(&r.name, 60), online);
            }
            println!("\n{} services | details: service <ID>", rows.len());
            Ok(())
        }
        Commands::Service { id } => {
            let Some(service) = store.get_service(id)? else {
                println!("No service with id {}.", id);
                return Ok(());
            };

            println!("{} [{}]", service.name, service.id);
            println!("Link:   {}", service.link);
            println!("Online: {}", if service.can_be_done_online { "yes" } else { "no" });

            match store.get_service_detail(id)? {
                Some(d) => {
                    if d.title != service.name {
                        println!("Title:  {}", d.title);
                    }
                    if let Some(p) = &d.prerequisites {
                        println!("\n--- Voraussetzungen ---\n{}", p);
                    }
                    if let Some(docs) = &d.required_documents {
                        println!("\n--- Erforderliche Unterlagen ---\n{}", docs);
                    }
                    println!("\n--- Beschreibung ---\n{}", sanitize::clean_description(&d.description));
                }
                None => println!("\n(no detail stored)"),
            }

            let forms = store.forms_for_service(id)?;
            if !forms.is_empty() {
                println!("\n--- Formulare ---");
                for f in &forms {
                    println!("  {}: {}", truncate(&f.title, 50), f.url);
                }
            }

            let locations = store.locations_for_service(id)?;
            if !locations.is_empty() {
                println!("\n--- Standorte ({}) ---", locations.len());
                for l in &locations {
                    println!(
                        "  {:>8} | {:<40} | {}",
                        l.id,
                        truncate(&l.name, 40),
                        l.address.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(())
        }
        Commands::Locations { search, limit } => {
            let rows = store.find_locations(search.as_deref(), limit)?;
            if rows.is_empty() {
                println!("No locations found.");
                return Ok(());
            }

            println!(
                "{:>8} | {:<40} | {:<36} | {:<18}",
                "ID", "Location", "Address", "Phone"
            );
            println!("{}", "-".repeat(112));
            for r in &rows {
                println!(
                    "{:>8} | {:<40} | {:<36} | {:<18}",
                    r.id,
                    truncate(&r.name, 40),
                    truncate(r.address.as_deref().unwrap_or("-"), 36),
                    r.phone.as_deref().unwrap_or("-")
                );
            }
            println!("\n{} locations", rows.len());
            Ok(())
        }
        Commands::Forms { search, limit } => {
            let rows = store.find_forms(search.as_deref(), limit)?;
            if rows.is_empty() {
                println!("No forms found.");
                return Ok(());
            }

            println!("{:>8} | {:<48} | {}", "Service", "Form", "URL");
            println!("{}", "-".repeat(100));
            for r in &rows {
                println!("{:>8} | {:<48} | {}", r.service_id, truncate(&r.title, 48), r.url);
            }
            println!("\n{} forms", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let c = store.counts()?;
            println!("Services:        {}", c.services);
            println!("Service details: {}", c.service_details);
            println!("Locations:       {}", c.locations);
            println!("Forms:           {}", c.forms);
            println!("Links:           {}", c.links);

            let runs = store.recent_runs(5)?;
            if !runs.is_empty() {
                println!("\n--- Recent runs ---");
                for r in &runs {
                    println!(
                        "  {:<9} {} | {} listed, {} stored, {} skipped, {} forms, {} links, {} orphans",
                        r.kind,
                        truncate(&r.finished_at, 19),
                        r.listed,
                        r.stored,
                        r.skipped,
                        r.forms,
                        r.links,
                        r.orphan_links
                    );
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn crawl_setup(settings: &Settings, args: CrawlArgs) -> anyhow::Result<(Arc<HttpFetcher>, CrawlOptions)> {
    let fetcher = HttpFetcher::new(settings).context("Failed to build HTTP client")?;
    let opts = CrawlOptions {
        base_url: settings.base_url()?,
        services_path: settings.services_path.clone(),
        locations_path: settings.locations_path.clone(),
        concurrency: args.concurrency.unwrap_or(settings.concurrency),
        limit: args.limit,
    };
    Ok((Arc::new(fetcher), opts))
}

fn print_report(report: &CrawlReport) {
    println!("Done: {}.", report.summary());
    for item in report.skipped.iter().take(20) {
        let id = item.id.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "  skipped {:>8} | {:<48} | {}",
            id,
            truncate(item.link.as_deref().unwrap_or("-"), 48),
            item.reason
        );
    }
    if report.skipped.len() > 20 {
        println!("  ... and {} more (see crawl_runs)", report.skipped.len() - 20);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
