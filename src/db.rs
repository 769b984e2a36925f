use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} does not exist")]
    MissingReference { entity: &'static str, id: i64 },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// How forms found on a detail page are written on repeated crawls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormPolicy {
    /// Skip a form whose (service_id, title, url) is already stored.
    #[default]
    Dedup,
    /// Insert every form found, every time.
    Append,
}

/// Sole writer of the persistent store. Owns its connection; dropping the
/// store closes it.
pub struct Store {
    conn: Connection,
    form_policy: FormPolicy,
}

impl Store {
    pub fn open(path: &Path, form_policy: FormPolicy) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {:?}", dir))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, form_policy })
    }

    #[cfg(test)]
    pub fn open_in_memory(form_policy: FormPolicy) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self { conn, form_policy };
        store.init_schema()?;
        Ok(store)
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS services (
                id                 INTEGER PRIMARY KEY,
                name               TEXT NOT NULL,
                link               TEXT NOT NULL,
                can_be_done_online BOOLEAN NOT NULL DEFAULT 0,
                updated_at         TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS service_details (
                id                 INTEGER PRIMARY KEY,
                service_id         INTEGER NOT NULL UNIQUE REFERENCES services(id),
                title              TEXT NOT NULL,
                description        TEXT NOT NULL,
                prerequisites      TEXT,
                required_documents TEXT,
                updated_at         TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS locations (
                id         INTEGER PRIMARY KEY,
                name       TEXT NOT NULL,
                link       TEXT NOT NULL,
                address    TEXT,
                phone      TEXT,
                fax        TEXT,
                email      TEXT,
                homepage   TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS forms (
                id         INTEGER PRIMARY KEY,
                service_id INTEGER NOT NULL REFERENCES services(id),
                title      TEXT NOT NULL,
                url        TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_forms_service ON forms(service_id);

            CREATE TABLE IF NOT EXISTS service_locations (
                service_id  INTEGER NOT NULL REFERENCES services(id),
                location_id INTEGER NOT NULL REFERENCES locations(id),
                PRIMARY KEY (service_id, location_id)
            );
            CREATE INDEX IF NOT EXISTS idx_service_locations_location
                ON service_locations(location_id);

            CREATE TABLE IF NOT EXISTS crawl_runs (
                id            INTEGER PRIMARY KEY,
                kind          TEXT NOT NULL,
                started_at    TEXT NOT NULL,
                finished_at   TEXT NOT NULL,
                listed        INTEGER NOT NULL,
                stored        INTEGER NOT NULL,
                skipped       INTEGER NOT NULL,
                forms         INTEGER NOT NULL,
                links         INTEGER NOT NULL,
                orphan_links  INTEGER NOT NULL,
                skipped_items TEXT
            );
            ",
        )?;
        Ok(())
    }

    /// Run `f` in one transaction; any error rolls back everything it wrote.
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    // ── Upserts ──

    pub fn upsert_service(&self, s: &ServiceRow) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(
                "INSERT INTO services (id, name, link, can_be_done_online)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    link = excluded.link,
                    can_be_done_online = excluded.can_be_done_online,
                    updated_at = datetime('now')",
            )?
            .execute(params![s.id, s.name, s.link, s.can_be_done_online])?;
        Ok(())
    }

    /// Keyed by `service_id`: the existing detail row is overwritten in place.
    pub fn upsert_service_detail(&self, d: &ServiceDetailRow) -> Result<(), StoreError> {
        self.require("service", "services", d.service_id)?;
        self.conn
            .prepare_cached(
                "INSERT INTO service_details
                    (service_id, title, description, prerequisites, required_documents)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(service_id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    prerequisites = excluded.prerequisites,
                    required_documents = excluded.required_documents,
                    updated_at = datetime('now')",
            )?
            .execute(params![
                d.service_id,
                d.title,
                d.description,
                d.prerequisites,
                d.required_documents,
            ])?;
        Ok(())
    }

    pub fn upsert_location(&self, l: &LocationRow) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(
                "INSERT INTO locations (id, name, link, address, phone, fax, email, homepage)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    link = excluded.link,
                    address = excluded.address,
                    phone = excluded.phone,
                    fax = excluded.fax,
                    email = excluded.email,
                    homepage = excluded.homepage,
                    updated_at = datetime('now')",
            )?
            .execute(params![
                l.id, l.name, l.link, l.address, l.phone, l.fax, l.email, l.homepage,
            ])?;
        Ok(())
    }

    /// Returns whether a row was written (always true under `FormPolicy::Append`).
    pub fn insert_form(&self, service_id: i64, title: &str, url: &str) -> Result<bool, StoreError> {
        self.require("service", "services", service_id)?;
        let sql = match self.form_policy {
            FormPolicy::Append => "INSERT INTO forms (service_id, title, url) VALUES (?1, ?2, ?3)",
            FormPolicy::Dedup => {
                "INSERT INTO forms (service_id, title, url)
                 SELECT ?1, ?2, ?3
                 WHERE NOT EXISTS (
                     SELECT 1 FROM forms WHERE service_id = ?1 AND title = ?2 AND url = ?3
                 )"
            }
        };
        let n = self
            .conn
            .prepare_cached(sql)?
            .execute(params![service_id, title, url])?;
        Ok(n > 0)
    }

    /// Idempotent association; returns whether a new row was inserted.
    /// Both ends must already exist, otherwise the link is rejected.
    pub fn link_service_to_location(
        &self,
        service_id: i64,
        location_id: i64,
    ) -> Result<bool, StoreError> {
        self.require("service", "services", service_id)?;
        self.require("location", "locations", location_id)?;
        let n = self
            .conn
            .prepare_cached(
                "INSERT OR IGNORE INTO service_locations (service_id, location_id) VALUES (?1, ?2)",
            )?
            .execute(params![service_id, location_id])?;
        Ok(n > 0)
    }

    fn require(&self, entity: &'static str, table: &str, id: i64) -> Result<(), StoreError> {
        let exists: bool = self.conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", table),
            [id],
            |r| r.get(0),
        )?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::MissingReference { entity, id })
        }
    }

    // ── Crawl runs ──

    pub fn record_run(&self, run: &RunRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO crawl_runs
             (kind, started_at, finished_at, listed, stored, skipped, forms, links,
              orphan_links, skipped_items)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.kind,
                run.started_at,
                run.finished_at,
                run.listed,
                run.stored,
                run.skipped,
                run.forms,
                run.links,
                run.orphan_links,
                run.skipped_items,
            ],
        )?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, started_at, finished_at, listed, stored, skipped, forms, links,
                    orphan_links, skipped_items
             FROM crawl_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(RunRow {
                    kind: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    listed: row.get(3)?,
                    stored: row.get(4)?,
                    skipped: row.get(5)?,
                    forms: row.get(6)?,
                    links: row.get(7)?,
                    orphan_links: row.get(8)?,
                    skipped_items: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Lookups ──

    pub fn find_services(
        &self,
        search: Option<&str>,
        online: Option<bool>,
        limit: usize,
    ) -> Result<Vec<ServiceRow>> {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(s) = search {
            conditions.push(format!("name LIKE '%' || ?{} || '%'", params.len() + 1));
            params.push(Box::new(s.to_string()));
        }
        if let Some(o) = online {
            conditions.push(format!("can_be_done_online = ?{}", params.len() + 1));
            params.push(Box::new(o));
        }

        let sql = format!(
            "SELECT id, name, link, can_be_done_online FROM services{} ORDER BY name LIMIT {}",
            where_clause(&conditions),
            limit
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), service_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_service(&self, id: i64) -> Result<Option<ServiceRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, link, can_be_done_online FROM services WHERE id = ?1",
                [id],
                service_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_service_detail(&self, service_id: i64) -> Result<Option<ServiceDetailRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT service_id, title, description, prerequisites, required_documents
                 FROM service_details WHERE service_id = ?1",
                [service_id],
                |row| {
                    Ok(ServiceDetailRow {
                        service_id: row.get(0)?,
                        title: row.get(1)?,
                        description: row.get(2)?,
                        prerequisites: row.get(3)?,
                        required_documents: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn forms_for_service(&self, service_id: i64) -> Result<Vec<FormRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, service_id, title, url FROM forms WHERE service_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([service_id], form_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn locations_for_service(&self, service_id: i64) -> Result<Vec<LocationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.id, l.name, l.link, l.address, l.phone, l.fax, l.email, l.homepage
             FROM locations l
             JOIN service_locations sl ON sl.location_id = l.id
             WHERE sl.service_id = ?1
             ORDER BY l.name",
        )?;
        let rows = stmt
            .query_map([service_id], location_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn find_locations(&self, search: Option<&str>, limit: usize) -> Result<Vec<LocationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, link, address, phone, fax, email, homepage
             FROM locations
             WHERE ?1 IS NULL OR name LIKE '%' || ?1 || '%'
             ORDER BY name LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![search, limit as i64], location_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn find_forms(&self, search: Option<&str>, limit: usize) -> Result<Vec<FormRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, service_id, title, url
             FROM forms
             WHERE ?1 IS NULL OR title LIKE '%' || ?1 || '%'
             ORDER BY title, id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![search, limit as i64], form_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Stats ──

    pub fn counts(&self) -> Result<Counts> {
        let count = |table: &str| -> Result<usize> {
            let n: usize =
                self.conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
            Ok(n)
        };
        Ok(Counts {
            services: count("services")?,
            service_details: count("service_details")?,
            locations: count("locations")?,
            forms: count("forms")?,
            links: count("service_locations")?,
        })
    }
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

// ── Rows ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRow {
    pub id: i64,
    pub name: String,
    pub link: String,
    pub can_be_done_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDetailRow {
    pub service_id: i64,
    pub title: String,
    pub description: String,
    pub prerequisites: Option<String>,
    pub required_documents: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationRow {
    pub id: i64,
    pub name: String,
    pub link: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub fax: Option<String>,
    pub email: Option<String>,
    pub homepage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormRow {
    pub id: i64,
    pub service_id: i64,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub kind: String,
    pub started_at: String,
    pub finished_at: String,
    pub listed: usize,
    pub stored: usize,
    pub skipped: usize,
    pub forms: usize,
    pub links: usize,
    pub orphan_links: usize,
    /// JSON array of skipped items.
    pub skipped_items: Option<String>,
}

pub struct Counts {
    pub services: usize,
    pub service_details: usize,
    pub locations: usize,
    pub forms: usize,
    pub links: usize,
}

fn service_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceRow> {
    Ok(ServiceRow {
        id: row.get(0)?,
        name: row.get(1)?,
        link: row.get(2)?,
        can_be_done_online: row.get(3)?,
    })
}

fn location_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocationRow> {
    Ok(LocationRow {
        id: row.get(0)?,
        name: row.get(1)?,
        link: row.get(2)?,
        address: row.get(3)?,
        phone: row.get(4)?,
        fax: row.get(5)?,
        email: row.get(6)?,
        homepage: row.get(7)?,
    })
}

fn form_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FormRow> {
    Ok(FormRow {
        id: row.get(0)?,
        service_id: row.get(1)?,
        title: row.get(2)?,
        url: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory(FormPolicy::Dedup).unwrap()
    }

    fn service(id: i64, name: &str, online: bool) -> ServiceRow {
        ServiceRow {
            id,
            name: name.into(),
            link: format!("https://service.berlin.de/dienstleistung/{}/", id),
            can_be_done_online: online,
        }
    }

    fn location(id: i64, name: &str) -> LocationRow {
        LocationRow {
            id,
            name: name.into(),
            link: format!("/standort/{}/", id),
            address: None,
            phone: None,
            fax: None,
            email: None,
            homepage: None,
        }
    }

    #[test]
    fn upsert_service_twice_keeps_one_row_with_latest_values() {
        let s = store();
        s.upsert_service(&service(101, "Alt", false)).unwrap();
        s.upsert_service(&service(101, "Neu", true)).unwrap();

        assert_eq!(s.counts().unwrap().services, 1);
        let row = s.get_service(101).unwrap().unwrap();
        assert_eq!(row.name, "Neu");
        assert!(row.can_be_done_online);
    }

    #[test]
    fn service_detail_keyed_by_service() {
        let s = store();
        s.upsert_service(&service(101, "A", false)).unwrap();
        let mut d = ServiceDetailRow {
            service_id: 101,
            title: "Titel".into(),
            description: "<p>eins</p>".into(),
            prerequisites: Some("Wohnsitz".into()),
            required_documents: None,
        };
        s.upsert_service_detail(&d).unwrap();
        d.description = "<p>zwei</p>".into();
        d.prerequisites = None;
        s.upsert_service_detail(&d).unwrap();

        assert_eq!(s.counts().unwrap().service_details, 1);
        let stored = s.get_service_detail(101).unwrap().unwrap();
        assert_eq!(stored, d);
    }

    #[test]
    fn detail_for_unknown_service_is_rejected() {
        let s = store();
        let err = s
            .upsert_service_detail(&ServiceDetailRow {
                service_id: 999,
                title: "x".into(),
                description: String::new(),
                prerequisites: None,
                required_documents: None,
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingReference { entity: "service", id: 999 }));
        assert_eq!(s.counts().unwrap().service_details, 0);
    }

    #[test]
    fn upsert_location_overwrites_optional_fields() {
        let s = store();
        let mut l = location(7, "Bürgeramt");
        l.phone = Some("115".into());
        s.upsert_location(&l).unwrap();
        l.phone = None;
        l.email = Some("a@b.de".into());
        s.upsert_location(&l).unwrap();

        let rows = s.find_locations(None, 10).unwrap();
        assert_eq!(rows, vec![l]);
    }

    #[test]
    fn link_is_idempotent() {
        let s = store();
        s.upsert_service(&service(1, "A", false)).unwrap();
        s.upsert_location(&location(2, "B")).unwrap();

        assert!(s.link_service_to_location(1, 2).unwrap());
        for _ in 0..5 {
            assert!(!s.link_service_to_location(1, 2).unwrap());
        }
        assert_eq!(s.counts().unwrap().links, 1);
        assert_eq!(s.locations_for_service(1).unwrap().len(), 1);
    }

    #[test]
    fn orphan_links_are_rejected() {
        let s = store();
        s.upsert_location(&location(2, "B")).unwrap();
        let err = s.link_service_to_location(404, 2).unwrap_err();
        assert!(matches!(err, StoreError::MissingReference { entity: "service", id: 404 }));

        s.upsert_service(&service(1, "A", false)).unwrap();
        let err = s.link_service_to_location(1, 3).unwrap_err();
        assert!(matches!(err, StoreError::MissingReference { entity: "location", id: 3 }));
        assert_eq!(s.counts().unwrap().links, 0);
    }

    #[test]
    fn form_policies() {
        let dedup = store();
        dedup.upsert_service(&service(1, "A", false)).unwrap();
        assert!(dedup.insert_form(1, "Antrag", "/a.pdf").unwrap());
        assert!(!dedup.insert_form(1, "Antrag", "/a.pdf").unwrap());
        assert!(dedup.insert_form(1, "Antrag", "/b.pdf").unwrap());
        assert_eq!(dedup.counts().unwrap().forms, 2);

        let append = Store::open_in_memory(FormPolicy::Append).unwrap();
        append.upsert_service(&service(1, "A", false)).unwrap();
        assert!(append.insert_form(1, "Antrag", "/a.pdf").unwrap());
        assert!(append.insert_form(1, "Antrag", "/a.pdf").unwrap());
        assert_eq!(append.counts().unwrap().forms, 2);
    }

    #[test]
    fn form_for_unknown_service_is_rejected() {
        let s = store();
        assert!(matches!(
            s.insert_form(5, "x", "/x.pdf"),
            Err(StoreError::MissingReference { entity: "service", id: 5 })
        ));
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let s = store();
        let result = s.in_transaction(|s| {
            s.upsert_service(&service(1, "A", false))?;
            s.insert_form(1, "Antrag", "/a.pdf")?;
            s.insert_form(2, "Fremd", "/b.pdf")?;
            Ok(())
        });
        assert!(result.is_err());
        let c = s.counts().unwrap();
        assert_eq!(c.services, 0);
        assert_eq!(c.forms, 0);
    }

    #[test]
    fn service_lookup_filters() {
        let s = store();
        s.upsert_service(&service(1, "Anmeldung einer Wohnung", true)).unwrap();
        s.upsert_service(&service(2, "Abmeldung einer Wohnung", false)).unwrap();
        s.upsert_service(&service(3, "Reisepass beantragen", false)).unwrap();

        assert_eq!(s.find_services(Some("Wohnung"), None, 50).unwrap().len(), 2);
        let online = s.find_services(Some("Wohnung"), Some(true), 50).unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, 1);
        assert_eq!(s.find_services(None, Some(false), 50).unwrap().len(), 2);
        assert_eq!(s.find_services(None, None, 1).unwrap().len(), 1);
    }

    #[test]
    fn form_lookup() {
        let s = store();
        s.upsert_service(&service(1, "A", false)).unwrap();
        s.insert_form(1, "Anmeldung bei der Meldebehörde", "/a.pdf").unwrap();
        s.insert_form(1, "Vollmacht", "/v.pdf").unwrap();

        assert_eq!(s.find_forms(None, 10).unwrap().len(), 2);
        let hits = s.find_forms(Some("Vollmacht"), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "/v.pdf");
        assert_eq!(s.forms_for_service(1).unwrap().len(), 2);
    }

    #[test]
    fn runs_are_recorded_newest_first() {
        let s = store();
        for kind in ["services", "locations"] {
            s.record_run(&RunRow {
                kind: kind.into(),
                started_at: "2024-01-01T00:00:00Z".into(),
                finished_at: "2024-01-01T00:01:00Z".into(),
                listed: 3,
                stored: 2,
                skipped: 1,
                forms: 0,
                links: 0,
                orphan_links: 0,
                skipped_items: Some("[]".into()),
            })
            .unwrap();
        }
        let runs = s.recent_runs(5).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].kind, "locations");
        assert_eq!(runs[1].skipped, 1);
    }

    #[test]
    fn schema_init_is_repeatable() {
        let s = store();
        s.init_schema().unwrap();
        s.init_schema().unwrap();
    }
}
