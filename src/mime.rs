//! MIME type registry
//!
//! Thread-safe extension to content-type mapping. Reload builds a fresh map
//! from the built-in defaults plus an optional mime types file and swaps it
//! in under a short mutex; lookups clone an `Arc` of the current map so the
//! lock is never held across I/O.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Longest accepted line in a mime types file.
const MAX_LINE: usize = 4096;

/// Built-in extension to content-type defaults, used when no mime types
/// file is configured and as the base layer when one is.
const DEFAULTS: &[(&str, &str)] = &[
    ("m3u", "audio/x-mpegurl"),
    ("pls", "audio/x-scpls"),
    ("xspf", "application/xspf+xml"),
    ("ogg", "application/ogg"),
    ("xml", "text/xml"),
    ("mp3", "audio/mpeg"),
    ("aac", "audio/aac"),
    ("aacp", "audio/aacp"),
    ("css", "text/css"),
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("jpg", "image/jpg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
];

/// Extension to content-type registry with atomic reload.
pub struct MimeRegistry {
    map: Mutex<Arc<BTreeMap<String, String>>>,
}

impl MimeRegistry {
    /// Create a registry holding only the built-in defaults.
    pub fn new() -> Self {
        Self {
            map: Mutex::new(Arc::new(Self::default_map())),
        }
    }

    fn default_map() -> BTreeMap<String, String> {
        DEFAULTS
            .iter()
            .map(|(ext, ty)| (ext.to_string(), ty.to_string()))
            .collect()
    }

    /// Rebuild the mapping from the defaults plus the given mime types file
    /// and swap it into place. A missing or unreadable file leaves the
    /// defaults in force.
    ///
    /// File format: `type ext [ext ...]`, whitespace separated; `#` starts a
    /// comment line; blank lines are skipped; lines are capped at 4096 bytes.
    pub fn reload(&self, path: Option<&Path>) {
        let mut fresh = Self::default_map();

        match path {
            None => {
                tracing::info!("no mime types file defined, using defaults");
            }
            Some(path) => match std::fs::File::open(path) {
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e,
                        "cannot open mime types file, using defaults");
                }
                Ok(file) => {
                    let mut reader = BufReader::new(file);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match reader.read_line(&mut line) {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                        if line.len() > MAX_LINE {
                            continue;
                        }
                        let trimmed = line.trim();
                        if trimmed.is_empty() || trimmed.starts_with('#') {
                            continue;
                        }
                        let mut fields = trimmed.split_whitespace();
                        let Some(mime) = fields.next() else { continue };
                        for ext in fields {
                            fresh.insert(ext.to_string(), mime.to_string());
                        }
                    }
                }
            },
        }

        let fresh = Arc::new(fresh);
        let mut current = self.map.lock().unwrap();
        *current = fresh;
    }

    fn snapshot(&self) -> Arc<BTreeMap<String, String>> {
        Arc::clone(&self.map.lock().unwrap())
    }

    /// Content type for a filesystem path, keyed on its extension.
    ///
    /// Paths without an extension map to `text/html`; unknown extensions map
    /// to `application/octet-stream`.
    pub fn content_type_for(&self, path: &str) -> String {
        let ext = match path.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() && !ext.contains('/') => ext,
            _ => return "text/html".to_string(),
        };
        self.snapshot()
            .get(&ext.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }

    /// Reverse lookup: first extension registered for a content type, used
    /// when generating playlist filenames. Any `;`-separated parameters on
    /// the type are ignored.
    pub fn ext_for_type(&self, content_type: &str) -> Option<String> {
        let bare = content_type
            .split(|c| c == ';' || c == ' ')
            .next()
            .unwrap_or("");
        if bare.is_empty() {
            return None;
        }
        self.snapshot()
            .iter()
            .find(|(_, ty)| ty.as_str() == bare)
            .map(|(ext, _)| ext.clone())
    }
}

impl Default for MimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_lookups() {
        let mime = MimeRegistry::new();
        assert_eq!(mime.content_type_for("/music/a.mp3"), "audio/mpeg");
        assert_eq!(mime.content_type_for("/a.OGG"), "application/ogg");
        assert_eq!(mime.content_type_for("/README"), "text/html");
        assert_eq!(
            mime.content_type_for("/data.bin"),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_reload_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# local additions").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "audio/flac flac").unwrap();
        writeln!(file, "video/webm webm weba").unwrap();
        file.flush().unwrap();

        let mime = MimeRegistry::new();
        mime.reload(Some(file.path()));

        assert_eq!(mime.content_type_for("/a.flac"), "audio/flac");
        assert_eq!(mime.content_type_for("/a.weba"), "video/webm");
        // defaults survive a reload
        assert_eq!(mime.content_type_for("/a.mp3"), "audio/mpeg");
    }

    #[test]
    fn test_reload_missing_file_keeps_defaults() {
        let mime = MimeRegistry::new();
        mime.reload(Some(Path::new("/nonexistent/mime.types")));
        assert_eq!(mime.content_type_for("/a.mp3"), "audio/mpeg");
    }

    #[test]
    fn test_ext_for_type() {
        let mime = MimeRegistry::new();
        assert_eq!(mime.ext_for_type("audio/mpeg").as_deref(), Some("mp3"));
        assert_eq!(
            mime.ext_for_type("audio/mpeg; charset=x").as_deref(),
            Some("mp3")
        );
        assert!(mime.ext_for_type("application/x-unknown").is_none());
        assert!(mime.ext_for_type("").is_none());
    }
}
