use std::sync::LazyLock;

use scraper::{ElementRef, Html, Node, Selector};

use super::{non_empty, text_of, ExtractError};

static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1.title").unwrap());
static MAIN_CONTENT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div#layout-grid__area--maincontent.servicedetail-view").unwrap()
});
static ONLINE_MARKER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h2#Online-Abwicklung").unwrap());
static FORMS_SCAN: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h2.title, ul.list-clean").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static BLOCK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.block").unwrap());
static HEADING: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h2").unwrap());

/// Description capture stops at this heading; everything after it is the
/// "responsible offices" box.
const STOP_HEADING: &str = "Für Sie zuständig";
const FORMS_HEADING: &str = "Formulare";
const PREREQUISITES_HEADING: &str = "Voraussetzungen";
const DOCUMENTS_HEADING: &str = "Erforderliche Unterlagen";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormLink {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ServiceDetailPage {
    pub title: String,
    /// Raw markup of the main content region; may contain boilerplate and
    /// form markup (see `sanitize::clean_description`).
    pub description: String,
    pub prerequisites: Option<String>,
    pub required_documents: Option<String>,
    pub online_capable: bool,
    pub forms: Vec<FormLink>,
}

pub fn extract(html: &str) -> Result<ServiceDetailPage, ExtractError> {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE)
        .next()
        .map(text_of)
        .and_then(non_empty)
        .ok_or(ExtractError::Missing("h1.title"))?;

    Ok(ServiceDetailPage {
        title,
        description: description(&document),
        prerequisites: block_text(&document, PREREQUISITES_HEADING),
        required_documents: block_text(&document, DOCUMENTS_HEADING),
        online_capable: document.select(&ONLINE_MARKER).next().is_some(),
        forms: forms(&document),
    })
}

fn description(document: &Html) -> String {
    let Some(main) = document.select(&MAIN_CONTENT).next() else {
        return String::new();
    };

    let stop = main.children().position(|node| {
        ElementRef::wrap(node)
            .is_some_and(|el| el.value().name() == "h2" && text_of(el).contains(STOP_HEADING))
    });

    match stop {
        None => main.inner_html(),
        // Serialize each child the way inner_html would
        Some(n) => main
            .children()
            .take(n)
            .map(|node| match node.value() {
                Node::Element(_) => ElementRef::wrap(node).map(|el| el.html()).unwrap_or_default(),
                Node::Text(text) => escape_text(text),
                Node::Comment(comment) => format!("<!--{}-->", &**comment),
                _ => String::new(),
            })
            .collect(),
    }
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Anchors of the first `ul.list-clean` after the "Formulare" heading.
fn forms(document: &Html) -> Vec<FormLink> {
    let mut after_heading = false;
    for el in document.select(&FORMS_SCAN) {
        if el.value().name() == "h2" {
            if !after_heading && text_of(el) == FORMS_HEADING {
                after_heading = true;
            }
            continue;
        }
        if after_heading {
            return el
                .select(&ANCHOR)
                .filter_map(|a| {
                    let url = a.value().attr("href")?.trim();
                    Some(FormLink {
                        title: text_of(a),
                        url: url.to_string(),
                    })
                })
                .collect();
        }
    }
    Vec::new()
}

fn block_text(document: &Html, heading: &str) -> Option<String> {
    document
        .select(&BLOCK)
        .find(|block| {
            block
                .select(&HEADING)
                .next()
                .is_some_and(|h| text_of(h) == heading)
        })
        .map(|block| {
            let text = text_of(block);
            text.strip_prefix(heading).unwrap_or(&text).trim().to_string()
        })
        .and_then(non_empty)
}
