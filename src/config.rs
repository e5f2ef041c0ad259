//! Server and per-mount configuration
//!
//! Held by the server under the topmost read-write lock of the §5-style
//! hierarchy: some paths take the config read lock only to resolve a mount
//! to a filesystem path or to a policy record.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Per-mount listener policy.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Maximum concurrent listeners; negative means unlimited, zero means
    /// the mount never admits (refused before the file is even opened).
    pub max_listeners: i64,

    /// Whether one account may hold several concurrent connections.
    pub allow_duplicate_users: bool,

    /// Access-log sink name handed to the auth collaborator on departure.
    pub access_log: Option<String>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            max_listeners: -1,
            allow_duplicate_users: true,
            access_log: None,
        }
    }
}

/// Server configuration options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for regular file mounts.
    pub base_dir: PathBuf,

    /// Root directory for mounts flagged as admin resources.
    pub admin_dir: PathBuf,

    /// Whether on-demand file serving is enabled at all.
    pub fileserve: bool,

    /// Optional MIME types file in `type ext [ext ...]` format.
    pub mime_types_path: Option<PathBuf>,

    /// Per-mount policy records.
    pub mounts: HashMap<String, MountConfig>,

    /// How often the scanner walks the handle cache.
    pub scan_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("webroot"),
            admin_dir: PathBuf::from("adminroot"),
            fileserve: true,
            mime_types_path: None,
            mounts: HashMap::new(),
            scan_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Look up the policy record for a mount, if one is configured.
    pub fn find_mount(&self, mount: &str) -> Option<&MountConfig> {
        self.mounts.get(mount)
    }

    /// Add or replace a mount policy (builder style).
    pub fn with_mount(mut self, mount: impl Into<String>, cfg: MountConfig) -> Self {
        self.mounts.insert(mount.into(), cfg);
        self
    }

    /// Resolve a normalised mount path to a filesystem path under the web
    /// root, or under the admin root when `use_admin` is set.
    ///
    /// Returns `None` for paths that would escape the root.
    pub fn resolve_path(&self, mount: &str, use_admin: bool) -> Option<PathBuf> {
        let root = if use_admin {
            &self.admin_dir
        } else {
            &self.base_dir
        };
        let rel = Path::new(mount.trim_start_matches('/'));
        for comp in rel.components() {
            match comp {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(root.join(rel))
    }
}
