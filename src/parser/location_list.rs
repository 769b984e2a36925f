//! Directory listing of all locations (`/standorte/`).

use super::listing::{self, EntryResult};
use super::ExtractError;

pub fn extract(html: &str) -> Result<Vec<EntryResult>, ExtractError> {
    listing::extract_entries(html)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_lists() {
        let html = std::fs::read_to_string("tests/fixtures/location_list.html").unwrap();
        let entries: Vec<_> = extract(&html)
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, 122210);
        assert_eq!(entries[0].name, "Bürgeramt Rathaus Mitte");
        assert_eq!(entries[0].link, "/standort/122210/");
        assert_eq!(entries[1].letter.as_deref(), Some("B"));
        assert_eq!(entries[2].id, 327795);
        assert_eq!(entries[2].letter.as_deref(), Some("S"));
    }

    #[test]
    fn empty_section_does_not_steal_next_list() {
        let html = r#"
            <div class="azlist-letter"><h2 class="letter">X</h2></div>
            <div class="azlist-letter"><h2 class="letter">Y</h2></div>
            <ul><li><a href="/standort/5/">Ypsilon</a></li></ul>
        "#;
        let entries = extract(html).unwrap();
        assert_eq!(entries.len(), 1);
        let e = entries[0].as_ref().unwrap();
        assert_eq!(e.id, 5);
        assert_eq!(e.letter.as_deref(), Some("Y"));
    }
}
