//! Per-job extraction of caller-supplied asset bundles.
//!
//! A bundle is a zip archive. Each job gets its own directory under the
//! vault root, keyed by the job handle, and the directory is owned by the
//! returned [`AssetBundle`] guard: it is removed on `release()` or, failing
//! that, when the guard is dropped.

use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::job::JobHandle;
use crate::sanitizer;

/// File extensions extracted from a bundle.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "gif", "jpeg", "jpg", "png", "svg", "bmp", "tif", "tiff", "css", "js", "woff", "ttf", "otf",
];

/// Content-derived types a written file may have. Files whose type cannot be
/// sniffed (plain text, SVG, CSS, JS) are kept.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/gif",
    "image/jpeg",
    "image/png",
    "image/svg+xml",
    "image/bmp",
    "image/x-bmp",
    "image/x-ms-bmp",
    "image/tiff",
    "text/plain",
    "text/css",
    "text/javascript",
    "application/javascript",
    "application/font-woff",
    "application/font-sfnt",
    "application/x-font-truetype",
    "application/x-font-opentype",
    "font/woff",
    "font/ttf",
    "font/otf",
];

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset bundle is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("asset bundle is not a readable zip archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("asset extraction failed: {0}")]
    Io(#[from] io::Error),
}

/// Extracted assets of one job.
#[derive(Debug)]
pub struct AssetBundle {
    dir: PathBuf,
    files: BTreeMap<String, PathBuf>,
    released: bool,
}

impl AssetBundle {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            files: BTreeMap::new(),
            released: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Logical name (path inside the archive) to absolute extracted path.
    pub fn files(&self) -> &BTreeMap<String, PathBuf> {
        &self.files
    }

    /// Removes the extraction directory.
    pub async fn release(mut self) -> io::Result<()> {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

impl Drop for AssetBundle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove asset directory {}: {}", self.dir.display(), err);
            }
        }
    }
}

/// Extracts bundles below a common root directory.
#[derive(Debug, Clone)]
pub struct AssetVault {
    root: PathBuf,
}

impl AssetVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, handle: &JobHandle) -> PathBuf {
        self.root.join(handle.as_str())
    }

    /// Extracts `zip_bytes` into the job's directory.
    ///
    /// Blocking; call from `spawn_blocking` inside async code. On error the
    /// partially extracted directory has already been removed.
    pub fn extract(&self, zip_bytes: &[u8], handle: &JobHandle) -> Result<AssetBundle, AssetError> {
        let dir = self.job_dir(handle);
        fs::create_dir_all(&dir)?;
        let mut bundle = AssetBundle::new(dir);

        let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))?;
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }

            let name = entry.name().to_string();
            let Some(relative) = entry.enclosed_name() else {
                warn!("Skipping asset with unsafe path: job_id={}, name={}", handle, name);
                continue;
            };

            let extension = extension_of(&relative);
            if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
                debug!("Skipping asset with disallowed extension: {}", name);
                continue;
            }

            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;

            let path = bundle.dir.join(&relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &data)?;

            if let Some(kind) = infer::get(&data) {
                if !ALLOWED_MIME_TYPES.contains(&kind.mime_type()) {
                    warn!(
                        "Removing asset with disallowed content type: name={}, mime={}",
                        name,
                        kind.mime_type()
                    );
                    fs::remove_file(&path)?;
                    continue;
                }
            }

            if extension == "js" || extension == "css" {
                let content = String::from_utf8_lossy(&data);
                fs::write(&path, sanitizer::clean(&content))?;
            }

            bundle.files.insert(name, path);
        }

        debug!(
            "Extracted assets: job_id={}, files={}",
            handle,
            bundle.files.len()
        );
        Ok(bundle)
    }

    /// Replaces every occurrence of each logical asset name in `html` with
    /// its absolute extracted path.
    pub fn resolve(&self, html: &str, bundle: &AssetBundle) -> String {
        resolve_paths(html, bundle.files())
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Asset names, longest first, so `img/logo.png` wins over `logo.png`.
fn longest_first(files: &BTreeMap<String, PathBuf>) -> Vec<&str> {
    let mut names: Vec<&str> = files.keys().map(String::as_str).collect();
    names.sort_by(|a, b| b.len().cmp(&a.len()));
    names
}

fn path_for(files: &BTreeMap<String, PathBuf>, name: &str) -> String {
    files
        .get(name)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn resolve_paths(html: &str, files: &BTreeMap<String, PathBuf>) -> String {
    if files.is_empty() {
        return html.to_string();
    }

    let names = longest_first(files);
    let pattern = names
        .iter()
        .map(|name| regex::escape(name))
        .collect::<Vec<_>>()
        .join("|");

    match Regex::new(&pattern) {
        Ok(matcher) => matcher
            .replace_all(html, |caps: &regex::Captures<'_>| path_for(files, &caps[0]))
            .into_owned(),
        Err(err) => {
            warn!(
                "Asset name matcher unavailable, scanning names directly: files={}, error={}",
                names.len(),
                err
            );
            scan_paths(html, files)
        }
    }
}

/// Leftmost, longest-name-first replacement without a compiled matcher.
fn scan_paths(html: &str, files: &BTreeMap<String, PathBuf>) -> String {
    let names = longest_first(files);
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(ch) = rest.chars().next() {
        match names.iter().find(|name| !name.is_empty() && rest.starts_with(**name)) {
            Some(name) => {
                out.push_str(&path_for(files, name));
                rest = &rest[name.len()..];
            }
            None => {
                out.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }
    }
    out
}
