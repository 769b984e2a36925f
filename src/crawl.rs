use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};
use url::Url;

use crate::db::{LocationRow, RunRow, ServiceDetailRow, ServiceRow, Store, StoreError};
use crate::fetch::{FetchError, Fetcher};
use crate::parser::listing::{EntryResult, ListEntry};
use crate::parser::location_detail::{self, LocationDetailPage};
use crate::parser::service_detail::{self, ServiceDetailPage};
use crate::parser::{location_list, service_list, ExtractError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlKind {
    Services,
    Locations,
}

impl fmt::Display for CrawlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CrawlKind::Services => "services",
            CrawlKind::Locations => "locations",
        })
    }
}

pub struct CrawlOptions {
    pub base_url: Url,
    pub services_path: String,
    pub locations_path: String,
    /// Concurrent detail fetches; writes stay serialized regardless.
    pub concurrency: usize,
    /// Only crawl the first N listed entries.
    pub limit: Option<usize>,
}

/// Why a single listed item was not stored.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("invalid link: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedItem {
    pub id: Option<i64>,
    pub link: Option<String>,
    pub reason: String,
}

#[derive(Debug)]
pub struct CrawlReport {
    pub kind: CrawlKind,
    pub listed: usize,
    pub stored: usize,
    pub skipped: Vec<SkippedItem>,
    /// Form rows written.
    pub forms: usize,
    /// New service↔location links.
    pub links: usize,
    /// Links rejected because the service is not in the store.
    pub orphan_links: usize,
    /// One record per rejected link; persisted with the skipped items.
    pub orphans: Vec<SkippedItem>,
}

impl CrawlReport {
    fn new(kind: CrawlKind) -> Self {
        Self {
            kind,
            listed: 0,
            stored: 0,
            skipped: Vec::new(),
            forms: 0,
            links: 0,
            orphan_links: 0,
            orphans: Vec::new(),
        }
    }

    fn skip(&mut self, id: Option<i64>, link: Option<&str>, reason: &dyn fmt::Display) {
        warn!(
            "Skipping {} entry {} ({}): {}",
            self.kind,
            id.map(|i| i.to_string()).unwrap_or_else(|| "-".into()),
            link.unwrap_or("no link"),
            reason
        );
        self.skipped.push(SkippedItem {
            id,
            link: link.map(str::to_string),
            reason: reason.to_string(),
        });
    }

    pub fn summary(&self) -> String {
        let mut s = format!(
            "{}: {} listed, {} stored, {} skipped",
            self.kind,
            self.listed,
            self.stored,
            self.skipped.len()
        );
        match self.kind {
            CrawlKind::Services => s.push_str(&format!(", {} forms", self.forms)),
            CrawlKind::Locations => s.push_str(&format!(
                ", {} new links, {} orphan links",
                self.links, self.orphan_links
            )),
        }
        s
    }
}

/// Services phase, then locations phase (links need the services to exist).
pub async fn crawl_all<F: Fetcher>(
    store: &Store,
    fetcher: Arc<F>,
    opts: &CrawlOptions,
) -> Result<Vec<CrawlReport>> {
    let services = crawl_services(store, Arc::clone(&fetcher), opts).await?;
    let locations = crawl_locations(store, fetcher, opts).await?;
    Ok(vec![services, locations])
}

pub async fn crawl_services<F: Fetcher>(
    store: &Store,
    fetcher: Arc<F>,
    opts: &CrawlOptions,
) -> Result<CrawlReport> {
    let started_at = Utc::now();
    let mut report = CrawlReport::new(CrawlKind::Services);
    let entries = list_phase(&*fetcher, opts, &mut report, service_list::extract).await?;

    let pb = progress_bar(entries.len())?;
    let mut rx = spawn_detail_fetches(
        &fetcher,
        &opts.base_url,
        entries,
        opts.concurrency,
        service_detail::extract,
    );

    // Single writer: every store mutation happens on this loop
    while let Some(DetailResult { entry, outcome }) = rx.recv().await {
        pb.set_message(entry.letter.clone().unwrap_or_default());
        let saved = outcome.and_then(|page| Ok(save_service(store, &entry, page)?));
        match saved {
            Ok(forms) => {
                report.stored += 1;
                report.forms += forms;
            }
            Err(e) => report.skip(Some(entry.id), Some(entry.link.as_str()), &e),
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    finish(store, &report, started_at)?;
    Ok(report)
}

pub async fn crawl_locations<F: Fetcher>(
    store: &Store,
    fetcher: Arc<F>,
    opts: &CrawlOptions,
) -> Result<CrawlReport> {
    let started_at = Utc::now();
    let mut report = CrawlReport::new(CrawlKind::Locations);
    let entries = list_phase(&*fetcher, opts, &mut report, location_list::extract).await?;

    let pb = progress_bar(entries.len())?;
    let mut rx = spawn_detail_fetches(
        &fetcher,
        &opts.base_url,
        entries,
        opts.concurrency,
        location_detail::extract,
    );

    while let Some(DetailResult { entry, outcome }) = rx.recv().await {
        pb.set_message(entry.letter.clone().unwrap_or_default());
        let saved = outcome.and_then(|page| Ok(save_location(store, &entry, page)?));
        match saved {
            Ok((linked, orphans)) => {
                report.stored += 1;
                report.links += linked;
                report.orphan_links += orphans.len();
                if !orphans.is_empty() {
                    warn!(
                        "Location {}: {} offered service(s) not in store, links rejected: {:?}",
                        entry.id,
                        orphans.len(),
                        orphans
                    );
                }
                report.orphans.extend(orphans.into_iter().map(|service_id| SkippedItem {
                    id: Some(service_id),
                    link: Some(entry.link.clone()),
                    reason: format!("service {} not in store (location {})", service_id, entry.id),
                }));
            }
            Err(e) => report.skip(Some(entry.id), Some(entry.link.as_str()), &e),
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    finish(store, &report, started_at)?;
    Ok(report)
}

/// Fetch and extract a listing page. Failure here aborts the phase; bad
/// entries are reported and dropped. Repeated ids collapse to the last one.
async fn list_phase<F: Fetcher>(
    fetcher: &F,
    opts: &CrawlOptions,
    report: &mut CrawlReport,
    extract: fn(&str) -> Result<Vec<EntryResult>, ExtractError>,
) -> Result<Vec<ListEntry>> {
    let path = match report.kind {
        CrawlKind::Services => &opts.services_path,
        CrawlKind::Locations => &opts.locations_path,
    };
    let url = opts
        .base_url
        .join(path)
        .with_context(|| format!("Invalid {} path {:?}", report.kind, path))?;

    info!("Fetching {} listing: {}", report.kind, url);
    let html = fetcher
        .fetch(url.as_str())
        .await
        .with_context(|| format!("Failed to fetch {} listing", report.kind))?;
    let mut results =
        extract(&html).with_context(|| format!("Unrecognized {} listing markup", report.kind))?;
    // Limit counts listing rows in page order, rejected ones included
    if let Some(n) = opts.limit {
        results.truncate(n);
    }

    let mut entries: Vec<ListEntry> = Vec::with_capacity(results.len());
    let mut positions: HashMap<i64, usize> = HashMap::new();
    let mut rejected = 0;
    for result in results {
        match result {
            Ok(entry) => match positions.get(&entry.id) {
                Some(&i) => entries[i] = entry,
                None => {
                    positions.insert(entry.id, entries.len());
                    entries.push(entry);
                }
            },
            Err(bad) => {
                rejected += 1;
                report.skip(None, bad.link.as_deref(), &bad.error);
            }
        }
    }

    report.listed = entries.len() + rejected;
    info!(
        "{} listing: {} entries to crawl, {} rejected",
        report.kind,
        entries.len(),
        rejected
    );
    Ok(entries)
}

struct DetailResult<T> {
    entry: ListEntry,
    outcome: Result<T, ItemError>,
}

/// Fetch + extract every entry's detail page on a bounded pool. Results arrive
/// on the returned channel in completion order.
fn spawn_detail_fetches<F, T>(
    fetcher: &Arc<F>,
    base_url: &Url,
    entries: Vec<ListEntry>,
    concurrency: usize,
    extract: fn(&str) -> Result<T, ExtractError>,
) -> mpsc::Receiver<DetailResult<T>>
where
    F: Fetcher,
    T: Send + 'static,
{
    let concurrency = concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let (tx, rx) = mpsc::channel(concurrency * 2);

    for entry in entries {
        let fetcher = Arc::clone(fetcher);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();
        let target = base_url.join(&entry.link);

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            let outcome = match target {
                Ok(url) => fetch_and_extract(&*fetcher, url.as_str(), extract).await,
                Err(e) => Err(e.into()),
            };
            let _ = tx.send(DetailResult { entry, outcome }).await;
        });
    }

    rx
}

async fn fetch_and_extract<F: Fetcher, T>(
    fetcher: &F,
    url: &str,
    extract: fn(&str) -> Result<T, ExtractError>,
) -> Result<T, ItemError> {
    let html = fetcher.fetch(url).await?;
    Ok(extract(&html)?)
}

/// Service + detail + forms in one transaction. Returns forms written.
fn save_service(
    store: &Store,
    entry: &ListEntry,
    page: ServiceDetailPage,
) -> Result<usize, StoreError> {
    store.in_transaction(|s| {
        s.upsert_service(&ServiceRow {
            id: entry.id,
            name: entry.name.clone(),
            link: entry.link.clone(),
            can_be_done_online: page.online_capable,
        })?;
        s.upsert_service_detail(&ServiceDetailRow {
            service_id: entry.id,
            title: page.title,
            description: page.description,
            prerequisites: page.prerequisites,
            required_documents: page.required_documents,
        })?;

        let mut written = 0;
        for form in &page.forms {
            if s.insert_form(entry.id, &form.title, &form.url)? {
                written += 1;
            }
        }
        Ok(written)
    })
}

/// Location + its service links in one transaction. Returns (new links,
/// service ids that could not be linked).
fn save_location(
    store: &Store,
    entry: &ListEntry,
    page: LocationDetailPage,
) -> Result<(usize, Vec<i64>), StoreError> {
    store.in_transaction(|s| {
        s.upsert_location(&LocationRow {
            id: entry.id,
            name: entry.name.clone(),
            link: entry.link.clone(),
            address: page.address,
            phone: page.phone,
            fax: page.fax,
            email: page.email,
            homepage: page.homepage,
        })?;

        let mut linked = 0;
        let mut orphans = Vec::new();
        for &service_id in &page.service_ids {
            match s.link_service_to_location(service_id, entry.id) {
                Ok(true) => linked += 1,
                Ok(false) => {}
                Err(StoreError::MissingReference { .. }) => orphans.push(service_id),
                Err(e) => return Err(e),
            }
        }
        Ok((linked, orphans))
    })
}

fn progress_bar(len: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta}) {msg}")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

fn finish(store: &Store, report: &CrawlReport, started_at: DateTime<Utc>) -> Result<()> {
    let items: Vec<&SkippedItem> = report.skipped.iter().chain(&report.orphans).collect();
    let skipped_items = if items.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&items)?)
    };
    store.record_run(&RunRow {
        kind: report.kind.to_string(),
        started_at: started_at.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        listed: report.listed,
        stored: report.stored,
        skipped: report.skipped.len(),
        forms: report.forms,
        links: report.links,
        orphan_links: report.orphan_links,
        skipped_items,
    })?;
    info!("{}", report.summary());
    Ok(())
}
