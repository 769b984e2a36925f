use std::sync::LazyLock;

use regex::Regex;

static FORM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<form[^>]*>.*?</form>").unwrap());

/// Site chrome that ends up inside captured descriptions.
const BOILERPLATE: &[&str] = &[
    "MAIN CONTENT",
    "Bitte wählen Sie zuerst einen Standort aus.",
    "Zu den verfügbaren Standorten",
    "An diesem Standort einen Termin buchen",
    "Seite als PDF herunterladen",
    "Download",
    "Stellen Sie unserem Chatbot Bobbi Ihre Fragen.",
    "Stellen Sie unserem bot Bobbi Ihre Fragen.",
    "Jetzt mit Bobbi in 11 Sprachen chatten",
    "Chat",
    "Für Sie zuständig",
    "Bitte wählen Sie für eine Terminvereinbarung einen Standort aus",
];

/// Strip known boilerplate phrases and embedded `<form>` markup from a stored
/// description. Display-time only; the store keeps the raw capture.
pub fn clean_description(description: &str) -> String {
    let mut cleaned = description.to_string();
    for phrase in BOILERPLATE {
        cleaned = cleaned.replace(phrase, "");
    }
    FORM_RE.replace_all(&cleaned, "").trim().to_string()
}
