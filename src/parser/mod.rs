pub mod listing;
pub mod location_detail;
pub mod location_list;
pub mod service_detail;
pub mod service_list;

use scraper::ElementRef;

/// Each page type exposes `extract(html) -> Result<_, ExtractError>`; extractors are
/// pure and never touch the network or the store.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("markup element not found: {0}")]
    Missing(&'static str),
    #[error("no numeric id in link {0:?}")]
    Identifier(String),
}

/// Whitespace-collapsed text content of an element.
pub fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Id from the last non-empty path segment: `https://host/dienstleistung/120686/` → 120686.
pub fn parse_trailing_id(link: &str) -> Result<i64, ExtractError> {
    let path = link.split(['?', '#']).next().unwrap_or(link);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|seg| seg.parse::<i64>().ok())
        .ok_or_else(|| ExtractError::Identifier(link.to_string()))
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_id_variants() {
        assert_eq!(
            parse_trailing_id("https://service.berlin.de/dienstleistung/120686/").unwrap(),
            120686
        );
        assert_eq!(parse_trailing_id("/standort/122210/").unwrap(), 122210);
        assert_eq!(parse_trailing_id("/standort/122210").unwrap(), 122210);
        assert_eq!(parse_trailing_id("/standort/122210/?lang=en#top").unwrap(), 122210);
    }

    #[test]
    fn trailing_id_rejects_non_numeric() {
        let err = parse_trailing_id("/dienstleistung/reisepass/").unwrap_err();
        assert!(matches!(err, ExtractError::Identifier(ref l) if l == "/dienstleistung/reisepass/"));
        assert!(parse_trailing_id("").is_err());
    }

    #[test]
    fn text_is_collapsed() {
        let html = scraper::Html::parse_fragment("<p>  Tel.:\n   030 \t 123 </p>");
        let sel = scraper::Selector::parse("p").unwrap();
        let p = html.select(&sel).next().unwrap();
        assert_eq!(text_of(p), "Tel.: 030 123");
    }
}
