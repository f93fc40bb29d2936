//! Content routing: map a fetch response to the processor that owns it.

use crate::fetcher::FetchResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutedKind {
    Html,
    Js,
    Api,
    Binary,
}

impl RoutedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutedKind::Html => "html",
            RoutedKind::Js => "js",
            RoutedKind::Api => "api",
            RoutedKind::Binary => "binary",
        }
    }
}

/// Substring match on content-type; falls back to the URL extension when the
/// header is missing, restricted to the configured include set.
pub fn route(response: &FetchResponse, url_path: &str, include_types: &[String]) -> RoutedKind {
    if let Some(content_type) = &response.content_type {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("text/html") || ct.contains("application/xhtml") {
            return RoutedKind::Html;
        }
        if ct.contains("javascript") {
            return RoutedKind::Js;
        }
        if ct.contains("json") {
            return RoutedKind::Api;
        }
        return RoutedKind::Binary;
    }

    guess_from_extension(url_path, include_types)
}

fn guess_from_extension(path: &str, include_types: &[String]) -> RoutedKind {
    let included = |kind: &str| include_types.iter().any(|t| t == kind);

    let last_segment = path.rsplit('/').next().unwrap_or("");
    let ext = last_segment
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("html") | Some("htm") if included("html") => RoutedKind::Html,
        Some("js") | Some("mjs") if included("js") => RoutedKind::Js,
        Some("json") | Some("map") if included("json") => RoutedKind::Api,
        None if included("html") => RoutedKind::Html,
        _ => RoutedKind::Binary,
    }
}
