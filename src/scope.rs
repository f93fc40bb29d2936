//! Scope enforcement: which canonical URLs the crawl is allowed to touch.

use crate::canonical::UrlRecord;
use regex::Regex;

/// Why a URL fell outside the crawl scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRejection {
    Scheme,
    Host,
    Extension,
    DisallowedPath,
}

impl ScopeRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeRejection::Scheme => "scheme",
            ScopeRejection::Host => "host",
            ScopeRejection::Extension => "extension",
            ScopeRejection::DisallowedPath => "disallowed-path",
        }
    }
}

/// Compiled scope rules. Built once from config and read-only afterwards.
pub struct ScopeGuard {
    allowed_domains: Vec<String>,
    exclude_extensions: Vec<String>,
    disallowed: Vec<Regex>,
}

impl ScopeGuard {
    pub fn new(
        allowed_domains: &[String],
        disallowed_paths: &[String],
        exclude_extensions: &[String],
    ) -> Result<Self, regex::Error> {
        let disallowed = disallowed_paths
            .iter()
            .map(|p| Regex::new(&wildcard_to_regex(p)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allowed_domains: allowed_domains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            exclude_extensions: exclude_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            disallowed,
        })
    }

    /// Apply the rules in order: scheme, host, extension, disallowed paths.
    pub fn check(&self, record: &UrlRecord) -> Result<(), ScopeRejection> {
        if record.scheme != "http" && record.scheme != "https" {
            return Err(ScopeRejection::Scheme);
        }

        if !self.host_allowed(&record.host) {
            return Err(ScopeRejection::Host);
        }

        if let Some(ext) = path_extension(&record.path) {
            if self.exclude_extensions.iter().any(|e| e == &ext) {
                return Err(ScopeRejection::Extension);
            }
        }

        if self.disallowed.iter().any(|re| re.is_match(&record.path)) {
            return Err(ScopeRejection::DisallowedPath);
        }

        Ok(())
    }

    pub fn allows(&self, record: &UrlRecord) -> bool {
        self.check(record).is_ok()
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_domains
            .iter()
            .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)))
    }
}

/// `*` becomes `.*`; every other metacharacter is escaped. Anchored at both
/// ends and case-insensitive.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

fn path_extension(path: &str) -> Option<String> {
    let last_segment = path.rsplit('/').next()?;
    let (_, ext) = last_segment.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}
