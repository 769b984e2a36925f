//! Directory listing of all services (`/dienstleistungen/`).

use super::listing::{self, EntryResult};
use super::ExtractError;

pub fn extract(html: &str) -> Result<Vec<EntryResult>, ExtractError> {
    listing::extract_entries(html)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> String {
        std::fs::read_to_string("tests/fixtures/service_list.html").unwrap()
    }

    #[test]
    fn entries_in_source_order() {
        let entries = extract(&fixture()).unwrap();
        assert_eq!(entries.len(), 5);

        let ok: Vec<_> = entries.iter().filter_map(|e| e.as_ref().ok()).collect();
        let ids: Vec<i64> = ok.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![120686, 120335, 121151]);

        assert_eq!(ok[1].name, "Abmeldung einer Wohnung");
        assert_eq!(ok[0].link, "https://service.berlin.de/dienstleistung/120686/");
        assert_eq!(ok[0].letter.as_deref(), Some("A"));
        assert_eq!(ok[2].letter.as_deref(), Some("P"));
    }

    #[test]
    fn bad_entries_do_not_hide_good_ones() {
        let entries = extract(&fixture()).unwrap();
        let rejected: Vec<_> = entries.iter().filter_map(|e| e.as_ref().err()).collect();
        assert_eq!(rejected.len(), 2);

        assert!(matches!(rejected[0].error, ExtractError::Identifier(_)));
        assert_eq!(
            rejected[0].link.as_deref(),
            Some("https://service.berlin.de/dienstleistung/reisepass/")
        );
        assert!(matches!(rejected[1].error, ExtractError::Missing(_)));
        assert!(rejected[1].link.is_none());

        // The entry right after the malformed one is still extracted
        let after = entries[3].as_ref().unwrap();
        assert_eq!(after.id, 121151);
    }

    #[test]
    fn navigation_lists_are_ignored() {
        let entries = extract(&fixture()).unwrap();
        assert!(entries
            .iter()
            .filter_map(|e| e.as_ref().ok())
            .all(|e| e.link.contains("/dienstleistung/")));
    }

    #[test]
    fn page_without_sections_is_rejected() {
        let err = extract("<html><body><ul><li><a href=\"/x/1/\">x</a></li></ul></body></html>")
            .unwrap_err();
        assert!(matches!(err, ExtractError::Missing("div.azlist-letter")));
    }
}
