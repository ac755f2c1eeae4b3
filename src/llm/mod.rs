//! Language model backends and stop-phrase handling.

pub mod api;

pub use api::ApiGenerator;

/// Whether `fragment` contains any of `stop_phrases`.
pub fn contains_stop_phrase(fragment: &str, stop_phrases: &[String]) -> bool {
    stop_phrases
        .iter()
        .any(|phrase| !phrase.is_empty() && fragment.contains(phrase.as_str()))
}

/// Remove every occurrence of every stop phrase and trim the result.
pub fn strip_stop_phrases(text: &str, stop_phrases: &[String]) -> String {
    let mut out = text.to_owned();
    for phrase in stop_phrases.iter().filter(|p| !p.is_empty()) {
        if out.contains(phrase.as_str()) {
            out = out.replace(phrase.as_str(), "");
        }
    }
    out.trim().to_owned()
}
