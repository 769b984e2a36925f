use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::{parse_trailing_id, text_of, ExtractError};

// Both selectors in one pass so matches come back in document order.
static SECTION_OR_LIST: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.azlist-letter, ul").unwrap());
static HEADING: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h2").unwrap());
static ITEM: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// One entry of an A–Z listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub id: i64,
    pub name: String,
    /// Raw `href` as found on the page (absolute or site-relative).
    pub link: String,
    /// Alphabetical section heading the entry was listed under.
    pub letter: Option<String>,
}

/// An entry that could not be turned into a `ListEntry`.
#[derive(Debug)]
pub struct RejectedEntry {
    pub link: Option<String>,
    pub error: ExtractError,
}

pub type EntryResult = Result<ListEntry, RejectedEntry>;

/// Extract every entry of an A–Z listing (`div.azlist-letter` followed by its `ul`).
///
/// Per-entry failures are returned in place so the caller can report them and carry on.
/// A page without any letter section is an error for the page as a whole.
pub fn extract_entries(html: &str) -> Result<Vec<EntryResult>, ExtractError> {
    let document = Html::parse_document(html);
    let mut entries = Vec::new();
    let mut sections = 0usize;
    let mut pending: Option<Option<String>> = None;

    for el in document.select(&SECTION_OR_LIST) {
        if el.value().name() == "div" {
            sections += 1;
            let letter = el.select(&HEADING).next().map(text_of);
            pending = Some(letter);
            continue;
        }
        // First <ul> after a letter section holds that section's entries
        if let Some(letter) = pending.take() {
            entries.extend(el.select(&ITEM).map(|li| parse_item(li, &letter)));
        }
    }

    if sections == 0 {
        return Err(ExtractError::Missing("div.azlist-letter"));
    }
    Ok(entries)
}

fn parse_item(li: ElementRef<'_>, letter: &Option<String>) -> EntryResult {
    let Some(anchor) = li.select(&ANCHOR).next() else {
        return Err(RejectedEntry {
            link: None,
            error: ExtractError::Missing("li > a[href]"),
        });
    };
    let link = anchor.value().attr("href").unwrap_or_default().trim().to_string();
    let name = text_of(anchor);

    let reject = |error| RejectedEntry {
        link: Some(link.clone()),
        error,
    };
    if name.is_empty() {
        return Err(reject(ExtractError::Missing("entry name")));
    }
    let id = parse_trailing_id(&link).map_err(reject)?;

    Ok(ListEntry {
        id,
        name,
        link,
        letter: letter.clone(),
    })
}
