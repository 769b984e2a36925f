use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::{non_empty, text_of, ExtractError};

static CONTACT: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.modul-contact").unwrap());
static ADDRESS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li.address.loc").unwrap());
static PHONE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li.tel").unwrap());
static FAX: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li.fax").unwrap());
static EMAIL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li.email a[href]").unwrap());
static HOMEPAGE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("li.homepage a[href]").unwrap());
static SERVICE_FORM: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("form.location_servicelist_checkboxgroup").unwrap());
static SERVICE_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"input[name="anliegen[]"]"#).unwrap());
static LEGACY_SERVICE_LINKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.modul-azlist a[href]").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationDetailPage {
    pub address: Option<String>,
    pub phone: Option<String>,
    pub fax: Option<String>,
    pub email: Option<String>,
    pub homepage: Option<String>,
    /// External ids of the services offered here, first occurrence order.
    pub service_ids: Vec<i64>,
}

/// Every field is optional; a page without a contact block or service list
/// yields an empty record rather than an error.
pub fn extract(html: &str) -> Result<LocationDetailPage, ExtractError> {
    let document = Html::parse_document(html);
    let mut page = LocationDetailPage {
        service_ids: service_ids(&document),
        ..Default::default()
    };

    if let Some(contact) = document.select(&CONTACT).next() {
        page.address = field_text(contact, &ADDRESS, "");
        page.phone = field_text(contact, &PHONE, "Tel.:");
        page.fax = field_text(contact, &FAX, "Fax:");
        page.email = field_href(contact, &EMAIL).map(|h| h.replace("mailto:", "").trim().to_string());
        page.homepage = field_href(contact, &HOMEPAGE);
    }

    Ok(page)
}

fn field_text(contact: ElementRef<'_>, selector: &Selector, label: &str) -> Option<String> {
    let el = contact.select(selector).next()?;
    let text = text_of(el);
    let value = if label.is_empty() {
        text
    } else {
        text.replace(label, "").trim().to_string()
    };
    non_empty(value)
}

fn field_href(contact: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let href = contact.select(selector).next()?.value().attr("href")?;
    non_empty(href.trim().to_string())
}

fn service_ids(document: &Html) -> Vec<i64> {
    let raw: Vec<i64> = match document.select(&SERVICE_FORM).next() {
        Some(form) => form
            .select(&SERVICE_INPUT)
            .filter_map(|input| input.value().attr("value")?.trim().parse().ok())
            .collect(),
        // Older markup: links like /dienstleistung/<id>/standort/<location>
        None => document
            .select(&LEGACY_SERVICE_LINKS)
            .filter_map(|a| legacy_service_id(a.value().attr("href")?))
            .collect(),
    };

    let mut ids = Vec::with_capacity(raw.len());
    for id in raw {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Third-from-last `/`-separated segment of the href, if numeric.
fn legacy_service_id(href: &str) -> Option<i64> {
    let parts: Vec<&str> = href.split('/').collect();
    if parts.len() < 3 {
        return None;
    }
    parts[parts.len() - 3].parse().ok()
}
