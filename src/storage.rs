//! Deterministic artifact placement under the output root, with atomic
//! temp-then-rename writes.

use crate::canonical::UrlRecord;
use md5::{Digest, Md5};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Html,
    Js,
    Api,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Html => "html",
            ArtifactKind::Js => "js",
            ArtifactKind::Api => "api",
        }
    }
}

pub struct Storage {
    root: PathBuf,
    pages_dir: String,
    js_dir: String,
    api_dir: String,
}

impl Storage {
    pub fn new(root: PathBuf, pages_dir: &str, js_dir: &str, api_dir: &str) -> std::io::Result<Self> {
        let storage = Self {
            root,
            pages_dir: pages_dir.to_string(),
            js_dir: js_dir.to_string(),
            api_dir: api_dir.to_string(),
        };
        std::fs::create_dir_all(storage.root.join(&storage.pages_dir))?;
        std::fs::create_dir_all(storage.root.join(&storage.js_dir))?;
        std::fs::create_dir_all(storage.root.join(&storage.api_dir))?;
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative path for an artifact of the given kind.
    pub fn path_for(&self, kind: ArtifactKind, record: &UrlRecord) -> String {
        match kind {
            ArtifactKind::Html => {
                if record.path == "/" && record.query.is_none() {
                    format!("{}/index.html", self.pages_dir)
                } else {
                    format!(
                        "{}/{}-{}.html",
                        self.pages_dir,
                        slugify(&format!("{}{}", record.host, record.path)),
                        url_hash(&record.canonical)
                    )
                }
            }
            ArtifactKind::Js => {
                let basename = js_basename(&record.path);
                let candidate = format!("{}/{}", self.js_dir, basename);
                if self.root.join(&candidate).exists() {
                    // Same basename, different content: disambiguate by URL hash.
                    let (stem, ext) = split_extension(&basename);
                    format!("{}/{}-{}.{}", self.js_dir, stem, url_hash(&record.canonical), ext)
                } else {
                    candidate
                }
            }
            ArtifactKind::Api => format!(
                "{}/{}-{}.json",
                self.api_dir,
                slugify(&format!("{}{}", record.host, record.path)),
                url_hash(&record.canonical)
            ),
        }
    }

    /// Write bytes to `relative` under the root: temp file in the same
    /// directory, then rename. A crash never leaves a half-written artifact.
    pub fn write_atomic(&self, relative: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = target.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &target)?;
        Ok(target)
    }
}

/// Atomic JSON write used by the manifest and checkpoint as well.
pub fn write_atomic_at(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Lowercase, non-alphanumeric runs collapsed to `-`, trimmed.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = false;
    for ch in input.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

fn url_hash(canonical: &str) -> String {
    hex::encode(&Md5::digest(canonical.as_bytes())[..4])
}

fn js_basename(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        "script.js".to_string()
    } else if name.ends_with(".js") || name.ends_with(".mjs") {
        name.to_string()
    } else {
        format!("{}.js", name)
    }
}

fn split_extension(basename: &str) -> (&str, &str) {
    basename.rsplit_once('.').unwrap_or((basename, "js"))
}
