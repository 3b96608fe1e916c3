//! Transfer descriptors (C1): immutable, pure-data contracts describing one
//! transfer (spec §3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::HeaderMap;
use url::Url;

/// Cache policy for a request. Mirrors the platform enum named in §3;
/// only the two values the engine actually branches on are modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    UseCache,
    ReloadIgnoringCache,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::UseCache
    }
}

/// Download-specific transfer descriptor. Method is fixed to GET (§3) so
/// server-assisted resume stays possible.
#[derive(Debug, Clone)]
pub struct DownloadDescriptor {
    pub source_url: Url,
    pub headers: HeaderMap,
    pub cache_policy: CachePolicy,
    pub timeout: Duration,
    pub destination_dir: PathBuf,
    /// Defaults to the last path segment of `source_url` when `None` (§3).
    pub file_name: Option<String>,
}

impl DownloadDescriptor {
    pub fn new(source_url: Url, destination_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_url,
            headers: HeaderMap::new(),
            cache_policy: CachePolicy::default(),
            timeout: Duration::from_secs(60),
            destination_dir: destination_dir.into(),
            file_name: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// File name used for the destination path: explicit override, else the
    /// last path segment of `source_url`, else `"download"`.
    pub fn file_name(&self) -> String {
        if let Some(name) = &self.file_name {
            return name.clone();
        }
        self.source_url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("download")
            .to_string()
    }

    /// Derived destination path = directory ⊕ file name (§3).
    pub fn destination_path(&self) -> PathBuf {
        self.destination_dir.join(self.file_name())
    }
}

/// Identity per §3: two download descriptors are the same record iff their
/// source URLs, cache policies, headers, destinations and timeouts all match.
impl PartialEq for DownloadDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.source_url == other.source_url
            && self.cache_policy == other.cache_policy
            && self.timeout == other.timeout
            && self.destination_path() == other.destination_path()
            && header_maps_equal(&self.headers, &other.headers)
    }
}
impl Eq for DownloadDescriptor {}

fn header_maps_equal(a: &HeaderMap, b: &HeaderMap) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(name, value)| b.get(name) == Some(value))
}

/// Upload payload composition (§3).
#[derive(Debug, Clone)]
pub enum UploadPayload {
    /// Inline bytes with an explicit field/file name and MIME type.
    Data {
        bytes: Vec<u8>,
        field_name: String,
        file_name: String,
        mime: String,
    },
    /// A single local file; the field name is applied to it, the MIME type
    /// is inferred from its extension.
    File { path: PathBuf, field_name: String },
    /// Several local files under one field name.
    Files { paths: Vec<PathBuf>, field_name: String },
}

/// Upload-specific transfer descriptor. Method is fixed to POST (§3).
#[derive(Debug, Clone)]
pub struct UploadDescriptor {
    pub destination_url: Url,
    pub headers: HeaderMap,
    pub cache_policy: CachePolicy,
    pub timeout: Duration,
    pub payload: UploadPayload,
    pub parameters: Option<HashMap<String, String>>,
    pub max_bytes: u64,
}

impl UploadDescriptor {
    pub fn new(destination_url: Url, payload: UploadPayload, max_bytes: u64) -> Self {
        Self {
            destination_url,
            headers: HeaderMap::new(),
            cache_policy: CachePolicy::default(),
            timeout: Duration::from_secs(60),
            payload,
            parameters: None,
            max_bytes,
        }
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// MIME-type lookup from a local file's extension, default
/// `application/octet-stream` (§4.6).
pub(crate) fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn file_name_defaults_to_last_path_segment() {
        let d = DownloadDescriptor::new(url("https://example.com/archive/report.pdf"), "/tmp");
        assert_eq!(d.file_name(), "report.pdf");
        assert_eq!(d.destination_path(), PathBuf::from("/tmp/report.pdf"));
    }

    #[test]
    fn file_name_override_wins() {
        let d = DownloadDescriptor::new(url("https://example.com/archive/report.pdf"), "/tmp")
            .with_file_name("renamed.pdf");
        assert_eq!(d.file_name(), "renamed.pdf");
    }

    #[test]
    fn equal_descriptors_match_by_url_policy_dest_and_timeout() {
        let a = DownloadDescriptor::new(url("https://example.com/x.bin"), "/tmp");
        let b = DownloadDescriptor::new(url("https://example.com/x.bin"), "/tmp");
        assert_eq!(a, b);

        let c = DownloadDescriptor::new(url("https://example.com/y.bin"), "/tmp");
        assert_ne!(a, c);
    }

    #[test]
    fn mime_guess_defaults_to_octet_stream() {
        assert_eq!(guess_mime(Path::new("report.pdf")), "application/pdf");
        assert_eq!(guess_mime(Path::new("noext")), "application/octet-stream");
    }
}
