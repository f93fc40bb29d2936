//! URL canonicalization: the stable form and key every other component keys on.

use sha1::{Digest, Sha1};
use url::Url;

/// Rules applied while normalizing query strings.
#[derive(Debug, Clone)]
pub struct CanonicalRules {
    /// Parameter-name patterns to drop. A trailing `*` makes the pattern a
    /// prefix match; otherwise the name must match exactly (case-insensitive).
    pub drop_params: Vec<String>,
    /// Sort surviving parameters lexicographically by key then value.
    pub sort_params: bool,
}

impl Default for CanonicalRules {
    fn default() -> Self {
        Self {
            drop_params: vec![
                "utm_*".to_string(),
                "gclid".to_string(),
                "fbclid".to_string(),
                "session*".to_string(),
            ],
            sort_params: true,
        }
    }
}

/// The normalized view of a URL used throughout the crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRecord {
    pub raw: String,
    pub canonical: String,
    pub url_key: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

/// Normalize a raw URL into its canonical form and stable key.
///
/// Order matters: relative resolution, host lowercasing, scheme gate,
/// fragment drop, dot-segment collapse (done by the parser), trailing-slash
/// rule, query sort and noise drop, percent-encoding uppercased. Pure and
/// side-effect free.
pub fn canonicalize(
    raw: &str,
    base: Option<&Url>,
    rules: &CanonicalRules,
) -> Result<UrlRecord, CanonicalError> {
    let parsed = match base {
        Some(base_url) => base_url
            .join(raw.trim())
            .map_err(|e| CanonicalError::InvalidUrl(format!("{}: {}", raw, e)))?,
        None => Url::parse(raw.trim())
            .map_err(|e| CanonicalError::InvalidUrl(format!("{}: {}", raw, e)))?,
    };

    let scheme = parsed.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(CanonicalError::UnsupportedScheme(scheme));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| CanonicalError::InvalidUrl(format!("{}: missing host", raw)))?
        .to_ascii_lowercase();

    // The parser collapsed dot-segments but keeps repeated slashes; collapse
    // those here along with the trailing-slash rule.
    let path = normalize_path(parsed.path());
    let query = normalize_query(parsed.query(), rules);

    let mut canonical = format!("{}://{}", scheme, host);
    if let Some(port) = parsed.port() {
        canonical.push(':');
        canonical.push_str(&port.to_string());
    }
    canonical.push_str(&path);
    if let Some(q) = &query {
        canonical.push('?');
        canonical.push_str(q);
    }

    let canonical = uppercase_percent_escapes(&canonical);
    let url_key = hex::encode(Sha1::digest(canonical.as_bytes()));

    Ok(UrlRecord {
        raw: raw.to_string(),
        canonical,
        url_key,
        scheme,
        host,
        path,
        query,
    })
}

/// Runs of `/` collapse to one; bare host becomes `/`; otherwise a single
/// trailing slash is stripped.
fn normalize_path(path: &str) -> String {
    let mut collapsed = String::with_capacity(path.len());
    let mut last_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if !last_slash {
                collapsed.push('/');
            }
            last_slash = true;
        } else {
            collapsed.push(ch);
            last_slash = false;
        }
    }

    if collapsed.is_empty() || collapsed == "/" {
        return "/".to_string();
    }
    if let Some(stripped) = collapsed.strip_suffix('/') {
        stripped.to_string()
    } else {
        collapsed
    }
}

/// Sort query pairs by key then value and drop noise parameters.
/// Pairs stay in their percent-encoded form so the result is stable.
fn normalize_query(query: Option<&str>, rules: &CanonicalRules) -> Option<String> {
    let query = query?;
    if query.is_empty() {
        return None;
    }

    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (part.to_string(), String::new()),
        })
        .filter(|(k, _)| !is_noise_param(k, &rules.drop_params))
        .collect();

    if pairs.is_empty() {
        return None;
    }

    if rules.sort_params {
        pairs.sort();
    }

    let joined = pairs
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join("&");

    Some(joined)
}

fn is_noise_param(name: &str, patterns: &[String]) -> bool {
    let name = name.to_ascii_lowercase();
    patterns.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        }
    })
}

/// Rewrite `%xx` escapes with uppercase hex digits.
fn uppercase_percent_escapes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let a = bytes[i + 1];
            let b = bytes[i + 2];
            if a.is_ascii_hexdigit() && b.is_ascii_hexdigit() {
                out.push('%');
                out.push((a as char).to_ascii_uppercase());
                out.push((b as char).to_ascii_uppercase());
                i += 3;
                continue;
            }
        }
        // Safe: iterating over ASCII boundaries only when matching '%'.
        let ch_len = utf8_len(bytes[i]);
        out.push_str(&input[i..i + ch_len]);
        i += ch_len;
    }
    out
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(raw: &str) -> UrlRecord {
        canonicalize(raw, None, &CanonicalRules::default()).unwrap()
    }

    #[test]
    fn lowercases_host_and_drops_fragment() {
        let rec = canon("https://A.Test/Foo#frag");
        assert_eq!(rec.canonical, "https://a.test/Foo");
        assert_eq!(rec.host, "a.test");
    }

    #[test]
    fn messy_url_normalizes_fully() {
        let rec = canon("https://A.test/Foo/?b=2&utm_source=x&a=1#frag");
        assert_eq!(rec.canonical, "https://a.test/Foo?a=1&b=2");
    }

    #[test]
    fn fbclid_stripped_like_utm() {
        let a = canon("https://a.test/p?fbclid=abc123&x=1");
        let b = canon("https://a.test/p?x=1");
        assert_eq!(a.canonical, b.canonical);
        assert_eq!(a.url_key, b.url_key);
    }

    #[test]
    fn rejects_non_http_schemes() {
        let err = canonicalize("ftp://a.test/x", None, &CanonicalRules::default());
        assert!(matches!(err, Err(CanonicalError::UnsupportedScheme(_))));
    }

    #[test]
    fn resolves_relative_against_base() {
        let base = Url::parse("https://a.test/dir/page").unwrap();
        let rec = canonicalize("../other", Some(&base), &CanonicalRules::default()).unwrap();
        assert_eq!(rec.canonical, "https://a.test/other");
    }

    #[test]
    fn dot_segments_collapse() {
        let a = canon("https://a.test/x/../y/./z");
        let b = canon("https://a.test/y/z");
        assert_eq!(a.canonical, b.canonical);
    }

    #[test]
    fn duplicate_slashes_collapse() {
        let a = canon("https://a.test/x//y");
        let b = canon("https://a.test/x/y");
        assert_eq!(a.canonical, b.canonical);
        assert_eq!(a.url_key, b.url_key);

        let trailing = canon("https://a.test/x//y//");
        assert_eq!(trailing.canonical, b.canonical);
    }

    #[test]
    fn bare_host_gets_root_path() {
        let rec = canon("https://a.test");
        assert_eq!(rec.canonical, "https://a.test/");
        assert_eq!(rec.path, "/");
    }

    #[test]
    fn trailing_slash_stripped_except_root() {
        assert_eq!(canon("https://a.test/dir/").canonical, "https://a.test/dir");
        assert_eq!(canon("https://a.test/").canonical, "https://a.test/");
    }

    #[test]
    fn query_sorted_by_key_then_value() {
        let rec = canon("https://a.test/p?b=2&a=2&a=1");
        assert_eq!(rec.canonical, "https://a.test/p?a=1&a=2&b=2");
    }

    #[test]
    fn percent_escapes_uppercased() {
        let rec = canon("https://a.test/p%2fq");
        assert!(rec.canonical.contains("%2F"));
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let inputs = [
            "https://A.test/Foo/?b=2&utm_source=x&a=1#frag",
            "https://a.test/x/../y?z=%2f",
            "http://a.test:8080/p/?id=3",
            "https://a.test//x//y//",
        ];
        for raw in inputs {
            let once = canon(raw);
            let twice = canon(&once.canonical);
            assert_eq!(once.canonical, twice.canonical, "input: {}", raw);
            assert_eq!(once.url_key, twice.url_key);
        }
    }

    #[test]
    fn equivalent_inputs_share_a_key() {
        let variants = [
            "https://A.TEST/page?b=2&a=1",
            "https://a.test/page?a=1&b=2#top",
            "https://a.test/x/../page?utm_campaign=q&a=1&b=2",
            "https://a.test//page?a=1&b=2",
        ];
        let keys: Vec<String> = variants.iter().map(|v| canon(v).url_key).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }
}
