//! File server facade
//!
//! Ties the handle cache, MIME registry, configuration and stats together
//! behind the operations the rest of the server calls: listener admission
//! and release, override migration, admin queries, the periodic scanner and
//! shutdown. Lock order is always config, then cache, then the per-handle
//! mutex, with the process-wide counters innermost.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cache::entry::Departure;
use crate::cache::{
    Expiry, FInfo, FileHandle, HandleCache, HandleFlags, ListenerEntry, Presence,
};
use crate::client::{Client, ClientFlags, SenderState, WorkerTime};
use crate::config::{Config, MountConfig};
use crate::error::{AdminError, AdmitError};
use crate::media;
use crate::mime::MimeRegistry;
use crate::rate::RateCalc;
use crate::stats::StatsRegistry;

/// How a routing collaborator answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The collaborator took ownership of the listener; do not destroy it.
    Taken,
    /// The collaborator refused; the caller destroys the listener.
    Declined,
}

/// Collaborator that rebinds listeners across mounts: back to a revived
/// live source on departure, or onto an override target during migration.
#[async_trait]
pub trait ListenerRouter: Send + Sync {
    /// Rebind a departing listener under its originating mount.
    async fn release_listener(
        &self,
        client: &mut Client,
        mount: &str,
        mount_cfg: Option<&MountConfig>,
    ) -> RouteOutcome;

    /// Rebind a listener to the mount named by `finfo` without dropping
    /// the connection.
    async fn move_listener(&self, client: &mut Client, finfo: &FInfo) -> RouteOutcome;
}

/// Router that refuses every rebind; listeners simply terminate.
pub struct NullRouter;

#[async_trait]
impl ListenerRouter for NullRouter {
    async fn release_listener(
        &self,
        _client: &mut Client,
        _mount: &str,
        _mount_cfg: Option<&MountConfig>,
    ) -> RouteOutcome {
        RouteOutcome::Declined
    }

    async fn move_listener(&self, _client: &mut Client, _finfo: &FInfo) -> RouteOutcome {
        RouteOutcome::Declined
    }
}

/// Result of an admin kill request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillResponse {
    pub found: bool,
    pub message: String,
}

impl KillResponse {
    /// Minimal response document for the admin renderer.
    pub fn to_xml(&self) -> String {
        format!(
            "<iceresponse><message>{}</message><return>{}</return></iceresponse>",
            xml_escape(&self.message),
            u8::from(self.found)
        )
    }
}

/// One listener as reported by the admin listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub id: u64,
    pub ip: String,
    pub connected_secs: u64,
    pub username: Option<String>,
}

/// Admin listing of a mount's listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListClients {
    pub mount: String,
    pub listeners: Vec<ListenerInfo>,
}

impl ListClients {
    /// Minimal stats document for the admin renderer.
    pub fn to_xml(&self) -> String {
        let mut out = format!(
            "<icestats><source mount=\"{}\">",
            xml_escape(&self.mount)
        );
        for l in &self.listeners {
            out.push_str(&format!(
                "<listener><id>{}</id><ip>{}</ip><connected>{}</connected></listener>",
                l.id,
                xml_escape(&l.ip),
                l.connected_secs
            ));
        }
        out.push_str(&format!(
            "<listeners>{}</listeners></source></icestats>",
            self.listeners.len()
        ));
        out
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Process-wide counters, innermost in the lock order. The meter mutex is
/// only ever held for the push itself.
pub(crate) struct GlobalState {
    listeners: AtomicUsize,
    send_pressure: AtomicU32,
    out_bitrate: std::sync::Mutex<RateCalc>,
}

/// The file-serving and fallback-streaming core.
pub struct FileServer {
    pub(crate) config: RwLock<Config>,
    pub(crate) cache: HandleCache,
    pub(crate) mime: MimeRegistry,
    pub(crate) stats: StatsRegistry,
    running: AtomicBool,
    global: GlobalState,
}

impl FileServer {
    /// Bring up the serving core: MIME table from config, cache seeded with
    /// the sentinel handle.
    pub fn new(config: Config) -> Arc<Self> {
        let mime = MimeRegistry::new();
        mime.reload(config.mime_types_path.as_deref());
        let server = Arc::new(Self {
            config: RwLock::new(config),
            cache: HandleCache::new(),
            mime,
            stats: StatsRegistry::new(),
            running: AtomicBool::new(true),
            global: GlobalState {
                listeners: AtomicUsize::new(0),
                send_pressure: AtomicU32::new(0),
                out_bitrate: std::sync::Mutex::new(RateCalc::default()),
            },
        });
        tracing::info!("file serving started");
        server
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// The sentinel handle used by requests that bind to no real file.
    pub fn sentinel(&self) -> &Arc<FileHandle> {
        self.cache.sentinel()
    }

    /// Current server-wide listener gauge.
    pub fn listener_count(&self) -> usize {
        self.global.listeners.load(Ordering::Relaxed)
    }

    /// Account a fallback listener into the server-wide gauge. The matching
    /// decrement happens on release.
    pub fn listener_joined(&self) {
        self.global.listeners.fetch_add(1, Ordering::Relaxed);
    }

    /// Bandwidth-governor input: above 1, senders add a per-tick slowdown.
    pub fn set_send_pressure(&self, level: u32) {
        self.global.send_pressure.store(level, Ordering::Relaxed);
    }

    pub(crate) fn send_pressure(&self) -> u32 {
        self.global.send_pressure.load(Ordering::Relaxed)
    }

    pub(crate) fn global_rate_add(&self, bytes: u64, now_ms: u64) {
        self.global.out_bitrate.lock().unwrap().add(bytes, now_ms);
    }

    /// Averaged server-wide outgoing rate in bytes per second.
    pub fn global_rate_avg(&self) -> u64 {
        self.global.out_bitrate.lock().unwrap().avg()
    }

    fn reduce_global_sampling(&self) {
        self.global.out_bitrate.lock().unwrap().reduce();
    }

    /// Rebuild the MIME table from the configured mime types file.
    pub async fn recheck_mime_types(&self) {
        let path = self.config.read().await.mime_types_path.clone();
        self.mime.reload(path.as_deref());
    }

    /// First extension registered for a content type.
    pub fn mime_ext_for(&self, content_type: &str) -> Option<String> {
        self.mime.ext_for_type(content_type)
    }

    /// Admit a listener onto the handle described by `finfo`, or onto the
    /// sentinel when `finfo` is `None` (error responses ride the same
    /// sender plumbing).
    ///
    /// On success the client is attached, its response values are computed
    /// and its sender armed. Errors map onto HTTP surfaces: see
    /// [`AdmitError`]. An open failure marks the caller's `finfo` with
    /// `MISSING` so retries short-circuit.
    pub async fn setup_client(
        &self,
        client: &mut Client,
        finfo: Option<&mut FInfo>,
    ) -> Result<(), AdmitError> {
        let now = WorkerTime::now();
        let (fh, mut state) = match finfo {
            Some(finfo) => {
                if finfo.flags.contains(HandleFlags::MISSING)
                    || (finfo.flags.contains(HandleFlags::FALLBACK) && finfo.limit == 0)
                {
                    return Err(AdmitError::Rejected);
                }
                let mount = finfo.mount.clone().unwrap_or_default();

                let cfg = self.config.read().await;
                let minfo = cfg.find_mount(&mount).cloned();
                let map = self.cache.write_map().await;

                match HandleCache::find_in(&map, finfo) {
                    Some(fh) => {
                        drop(cfg);
                        let state = fh.lock_owned().await;
                        drop(map);
                        if let Some(minfo) = &minfo {
                            if minfo.max_listeners >= 0
                                && state.refcount as i64 >= minfo.max_listeners
                            {
                                return Err(AdmitError::ForbiddenRedirect(mount));
                            }
                            if !minfo.allow_duplicate_users {
                                if let Some(user) = &client.username {
                                    if state.has_user(user) {
                                        return Err(AdmitError::Forbidden(
                                            "Account already in use",
                                        ));
                                    }
                                }
                            }
                        }
                        (fh, state)
                    }
                    None => {
                        if minfo.as_ref().is_some_and(|m| m.max_listeners == 0) {
                            return Err(AdmitError::ForbiddenRedirect(mount));
                        }
                        match self.cache.open(map, cfg, &self.mime, finfo).await {
                            None => {
                                finfo.flags.insert(HandleFlags::MISSING);
                                return Err(AdmitError::NotFound);
                            }
                            Some((fh, state)) => {
                                if state.finfo.limit > 0 {
                                    tracing::debug!(
                                        mount = %mount,
                                        bitrate = state.finfo.limit * 8,
                                        "request for throttled file"
                                    );
                                }
                                (fh, state)
                            }
                        }
                    }
                }
            }
            None => {
                // no descriptor: error responses still need the sender
                // plumbing, through an ad-hoc handle or the sentinel
                let fh = if client.flags.contains(ClientFlags::AUTHENTICATED)
                    && client.mount.is_some()
                    && !(200..300).contains(&client.respcode)
                {
                    FileHandle::adhoc(client.mount.clone().unwrap())
                } else {
                    Arc::clone(self.cache.sentinel())
                };
                let state = fh.lock_owned().await;
                (fh, state)
            }
        };

        if state.finfo.limit > 0 {
            client.timer_start = now.secs;
            if client.connection.sent_bytes == 0 {
                // backdate so the first second does not burst
                client.timer_start -= 2;
            }
            client.counter = 0;
            self.reduce_global_sampling();
        }

        client.mount = state.finfo.mount.clone();

        if client.respcode == 0 {
            let frame_start = state
                .media
                .as_ref()
                .map(|m| m.frame_start_pos)
                .unwrap_or(0);
            let f_range = state.finfo.fsize.saturating_sub(frame_start);
            if client.connection.end_unspecified {
                client.connection.discon_sent = f_range;
            } else if client.connection.discon_sent > f_range {
                drop(state);
                client.mount = None;
                return Err(AdmitError::RangeNotSatisfiable);
            }
            client.connection.discon_sent = client
                .connection
                .discon_sent
                .saturating_sub(client.connection.start_pos);
            if state.finfo.limit > 0 {
                // content loops indefinitely; keep-alive makes no sense
                client.flags.remove(ClientFlags::KEEPALIVE);
            }
            let content_type = state
                .media
                .as_ref()
                .map(|m| m.format.content_type.clone())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            client.push_intro_front(media::client_headers(
                &content_type,
                client.connection.discon_sent,
                client.flags.contains(ClientFlags::KEEPALIVE),
            ));
            client.respcode = 200;
        }

        state.add_listener(
            ListenerEntry {
                id: client.connection.id,
                ip: client.connection.ip.clone(),
                username: client.username.clone(),
                error: Arc::clone(&client.connection.error),
                connected_at: now.secs,
            },
            &self.stats,
        );
        client.handle = Some(fh);
        drop(state);

        client.sender = SenderState::Intro;
        client.flags.insert(ClientFlags::IN_FSERVE);
        client.flags.remove(ClientFlags::HAS_INTRO_CONTENT);
        Ok(())
    }

    /// Classify and admit a request for a static file under the web root.
    ///
    /// Refuses with not-found when on-demand serving is disabled, the path
    /// escapes the root, or the target is not a regular file.
    pub async fn serve_file(&self, client: &mut Client, path: &str) -> Result<(), AdmitError> {
        let cfg = self.config.read().await;
        let fileserve = cfg.fileserve;
        let Some(fullpath) = cfg.resolve_path(path, false) else {
            return Err(AdmitError::NotFound);
        };
        drop(cfg);
        tracing::debug!(path, full = %fullpath.display(), "checking for file");

        let meta = match std::fs::metadata(&fullpath) {
            Ok(meta) => meta,
            Err(e) => {
                if !client.flags.contains(ClientFlags::SKIP_ACCESSLOG) {
                    tracing::warn!(path = %fullpath.display(), error = %e, "request for file");
                }
                return Err(AdmitError::NotFound);
            }
        };
        if !fileserve {
            tracing::debug!(path, "on demand file refused");
            return Err(AdmitError::NotFound);
        }
        if !meta.is_file() {
            tracing::warn!(path, "found requested file but there is no handler for it");
            return Err(AdmitError::NotFound);
        }

        let mut finfo = FInfo::file(path);
        finfo.fsize = meta.len();
        self.stats.incr_file_connections();
        self.setup_client(client, Some(&mut finfo)).await
    }

    /// Detach a listener from a handle. A tombstoned handle losing its last
    /// listener is destroyed here; it is already unreachable from the cache.
    pub(crate) async fn detach_handle(&self, fh: &Arc<FileHandle>, id: u64, now_secs: u64) {
        let mut state = fh.lock_owned().await;
        if state.remove_listener(id, now_secs, &self.stats) == Departure::Destroy {
            state.destroy(&self.stats);
        }
    }

    /// Release a departing listener.
    ///
    /// Authenticated GET listeners are handed back to the routing
    /// collaborator under their originating mount, which may rebind them
    /// (e.g. a live source reappeared). `Declined` means the caller owns
    /// destroying the client. `client.uri` carries the originating request
    /// URL; admin requests and non-GET requests leave it unset and get a
    /// plain detach.
    pub async fn release_client(
        &self,
        client: &mut Client,
        router: &dyn ListenerRouter,
    ) -> RouteOutcome {
        let now = WorkerTime::now();
        let Some(fh) = client.handle.clone() else {
            client.flags.remove(ClientFlags::IN_FSERVE);
            return RouteOutcome::Declined;
        };
        let (is_fallback, fh_mount) = {
            let state = fh.lock_owned().await;
            (
                state.finfo.flags.contains(HandleFlags::FALLBACK),
                state.finfo.mount.clone(),
            )
        };

        if is_fallback && client.flags.contains(ClientFlags::AUTHENTICATED) {
            let _ = self
                .global
                .listeners
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(1))
                });
        }
        client.clear_intro();

        let mut outcome = RouteOutcome::Declined;
        let routable = client.flags.contains(ClientFlags::AUTHENTICATED)
            && client
                .uri
                .as_deref()
                .map(|u| !u.starts_with("/admin"))
                .unwrap_or(false);

        if routable {
            let mount = if is_fallback {
                client.uri.clone()
            } else if client.mount.is_some() {
                client.mount.clone()
            } else {
                fh_mount
            };
            match mount {
                Some(mount) => {
                    self.detach_handle(&fh, client.connection.id, now.secs).await;
                    client.handle = None;
                    let minfo = self.config.read().await.find_mount(&mount).cloned();
                    outcome = router
                        .release_listener(client, &mount, minfo.as_ref())
                        .await;
                }
                None => {
                    self.detach_handle(&fh, client.connection.id, now.secs).await;
                    client.handle = None;
                }
            }
        } else {
            self.detach_handle(&fh, client.connection.id, now.secs).await;
            client.handle = None;
        }

        if outcome == RouteOutcome::Declined {
            client.flags.remove(ClientFlags::AUTHENTICATED);
            client.flags.remove(ClientFlags::IN_FSERVE);
        }
        self.reduce_global_sampling();
        outcome
    }

    /// Atomically redirect the listeners of a fallback mount to `dest`;
    /// see [`HandleCache::set_override`]. Returns false when `mount` has no
    /// fallback handle.
    pub async fn set_override(
        &self,
        mount: &str,
        dest: &str,
        kind: crate::media::FormatKind,
    ) -> bool {
        self.cache.set_override(mount, dest, kind, &self.stats).await
    }

    /// Find a listener by connection id under `mount` (plain first, then
    /// fallback) and flag it for termination on its next sender tick.
    pub async fn kill_client(
        &self,
        mount: &str,
        id: Option<u64>,
    ) -> Result<KillResponse, AdminError> {
        let Some(id) = id else {
            return Err(AdminError::BadRequest("id"));
        };

        let mut found = false;
        for flags in [HandleFlags::empty(), HandleFlags::FALLBACK] {
            let finfo = FInfo {
                mount: Some(mount.to_string()),
                flags,
                ..FInfo::default()
            };
            let map = self.cache.read_map().await;
            let Some(fh) = HandleCache::find_in(&map, &finfo) else {
                continue;
            };
            let state = fh.lock_owned().await;
            drop(map);
            if let Some(listeners) = &state.listeners {
                if let Some(entry) = listeners.get(&id) {
                    entry.error.store(true, Ordering::Relaxed);
                    found = true;
                }
            }
            if found {
                break;
            }
        }

        let message = if found {
            format!("Client {} removed", id)
        } else {
            format!("Client {} not found", id)
        };
        Ok(KillResponse { found, message })
    }

    async fn listeners_of(&self, finfo: &FInfo) -> Option<Vec<ListenerInfo>> {
        let now = WorkerTime::now();
        let map = self.cache.read_map().await;
        let fh = HandleCache::find_in(&map, finfo)?;
        let state = fh.lock_owned().await;
        drop(map);
        Some(
            state
                .listeners
                .iter()
                .flat_map(|l| l.values())
                .map(|e| ListenerInfo {
                    id: e.id,
                    ip: e.ip.clone(),
                    connected_secs: now.secs.saturating_sub(e.connected_at),
                    username: e.username.clone(),
                })
                .collect(),
        )
    }

    /// Enumerate the listeners of a mount. A fallback probe that finds no
    /// handle is retried as a plain file probe.
    pub async fn list_clients(&self, finfo: &FInfo) -> Result<ListClients, AdminError> {
        let mount = finfo.mount.clone().unwrap_or_default();
        let mut listeners = self.listeners_of(finfo).await;
        if listeners.is_none() && finfo.flags.contains(HandleFlags::FALLBACK) {
            let mut retry = finfo.clone();
            retry.flags.remove(HandleFlags::FALLBACK);
            listeners = self.listeners_of(&retry).await;
        }
        match listeners {
            Some(listeners) => Ok(ListClients { mount, listeners }),
            None => Err(AdminError::NoSuchMount(mount)),
        }
    }

    /// Listener count for a mount. A rate-limited fallback probe opens the
    /// handle on demand; a freshly opened idle handle is given a short
    /// expiry so probing does not pin it forever.
    pub async fn query_count(&self, finfo: &FInfo) -> Option<usize> {
        if finfo.flags.contains(HandleFlags::FALLBACK) && finfo.limit > 0 {
            let cfg = self.config.read().await;
            let map = self.cache.write_map().await;
            let (_fh, mut state) = self.cache.open(map, cfg, &self.mime, finfo).await?;
            let count = state.refcount;
            if count == 0 {
                state.expire = Expiry::At(WorkerTime::now().secs + 20);
            }
            Some(count)
        } else {
            let map = self.cache.read_map().await;
            let fh = HandleCache::find_in(&map, finfo)?;
            let state = fh.lock_owned().await;
            drop(map);
            Some(state.refcount)
        }
    }

    /// Presence probe with try-lock semantics; `Busy` means retry later.
    pub fn contains(&self, name: &str) -> Presence {
        self.cache.contains(name)
    }

    /// Walk the cache: refresh stats, reap expired handles. `now == 0`
    /// marks every handle for destruction on the following pass.
    pub async fn scan(&self, now: u64) {
        self.cache.scan(now, &self.stats).await;
    }

    /// Scan with the current clock, or with the shutdown marker once the
    /// server is stopping.
    pub async fn scan_now(&self) {
        let now = if self.is_running() {
            WorkerTime::now().secs
        } else {
            0
        };
        self.scan(now).await;
    }

    /// Spawn the periodic scanner task.
    pub fn spawn_scanner(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let interval = server.config.read().await.scan_interval;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !server.is_running() {
                    break;
                }
                server.scan_now().await;
            }
        })
    }

    /// Stop serving and drain the cache down to the sentinel. Senders
    /// observe the stop on their next tick and terminate; handles still
    /// holding references after the bounded wait are logged and abandoned.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.scan(0).await;

        let mut tries = 20;
        while tries > 0 {
            let remaining = self.cache.drain_pass(&self.stats).await;
            if remaining == 0 {
                break;
            }
            tracing::debug!(remaining, "waiting for entries to clear");
            tokio::time::sleep(Duration::from_millis(100)).await;
            tries -= 1;
        }
        tracing::info!("file serving stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing;
    use crate::client::Connection;
    use crate::media::mpeg::tests::frames_with_prefix;
    use crate::media::FormatKind;
    use crate::sender::SendOutcome;
    use std::io::Write;
    use std::sync::Mutex;

    struct Fixture {
        server: Arc<FileServer>,
        _root: tempfile::TempDir,
    }

    fn write_file(dir: &std::path::Path, name: &str, bytes: &[u8]) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(bytes).unwrap();
    }

    fn fixture_with(configure: impl FnOnce(&mut Config)) -> Fixture {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let root = tempfile::tempdir().unwrap();
        write_file(root.path(), "a.mp3", &[0x41u8; 4096]);
        write_file(root.path(), "silence.mp3", &frames_with_prefix(b"JUNK", 40));
        write_file(root.path(), "other.mp3", &frames_with_prefix(b"", 40));
        let mut config = Config {
            base_dir: root.path().to_path_buf(),
            ..Config::default()
        };
        configure(&mut config);
        Fixture {
            server: FileServer::new(config),
            _root: root,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fallback_client(id: u64) -> (Client, Arc<Mutex<Vec<u8>>>, Arc<Mutex<usize>>) {
        let (mut client, written, budget) = testing::client(id);
        client.flags.insert(ClientFlags::AUTHENTICATED);
        client.respcode = 200;
        client.connection.sent_bytes = 1;
        (client, written, budget)
    }

    /// Drive the clock and the sender until `until_secs` of simulated time
    /// have elapsed; returns the bytes counted against the throttle.
    async fn run_throttled(
        server: &FileServer,
        client: &mut Client,
        start: WorkerTime,
        until_secs: u64,
    ) -> u64 {
        let mut now = start;
        let end = start.millis + until_secs * 1000;
        while now.millis < end {
            let outcome = server.tick(client, now, &NullRouter).await;
            assert_eq!(outcome, SendOutcome::Continue);
            let next = client.schedule_ms.max(now.millis + 10).min(end);
            now = WorkerTime {
                millis: next,
                secs: next / 1000,
            };
        }
        client.counter
    }

    // --- admission -------------------------------------------------------

    #[tokio::test]
    async fn test_static_file_end_to_end() {
        let fx = fixture();
        let (mut client, written, _) = testing::client(1);
        client.flags.insert(ClientFlags::AUTHENTICATED);

        fx.server.serve_file(&mut client, "/a.mp3").await.unwrap();
        assert_eq!(client.respcode, 200);
        assert_eq!(fx.server.stats.file_connections(), 1);

        // headers drain, then the whole body streams and the sender ends
        let now = WorkerTime { secs: 50, millis: 50_000 };
        let outcome = fx.server.tick(&mut client, now, &NullRouter).await;
        assert_eq!(outcome, SendOutcome::Terminate);

        let written = written.lock().unwrap();
        let text = String::from_utf8_lossy(&written);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 4096\r\n"));
        let body_start = text.find("\r\n\r\n").unwrap() + 4;
        assert_eq!(written.len() - body_start, 4096);
        drop(written);

        // release: refcount drops to zero, handle expires two minutes out
        fx.server.release_client(&mut client, &NullRouter).await;
        let fh = fx.server.cache.find(&FInfo::file("/a.mp3")).await.unwrap();
        let state = fh.lock_owned().await;
        assert_eq!(state.refcount, 0);
        let future = WorkerTime::now().secs + 100;
        match state.expire {
            Expiry::At(t) => assert!(t > future),
            other => panic!("expected timed expiry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_file_marks_finfo() {
        let fx = fixture();
        let (mut client, _, _) = testing::client(1);
        let mut finfo = FInfo::file("/nope.mp3");

        assert_eq!(
            fx.server.setup_client(&mut client, Some(&mut finfo)).await,
            Err(AdmitError::NotFound)
        );
        assert!(finfo.flags.contains(HandleFlags::MISSING));

        // retries short-circuit without touching the cache
        assert_eq!(
            fx.server.setup_client(&mut client, Some(&mut finfo)).await,
            Err(AdmitError::Rejected)
        );
    }

    #[tokio::test]
    async fn test_fallback_without_limit_rejected() {
        let fx = fixture();
        let (mut client, _, _) = testing::client(1);
        let mut finfo = FInfo::fallback("/silence.mp3", 0);
        assert_eq!(
            fx.server.setup_client(&mut client, Some(&mut finfo)).await,
            Err(AdmitError::Rejected)
        );
    }

    #[tokio::test]
    async fn test_range_past_eof_is_refused() {
        let fx = fixture();
        let (mut client, _, _) = testing::client(1);
        client.connection.end_unspecified = false;
        client.connection.discon_sent = 10_000;

        let mut finfo = FInfo::file("/a.mp3");
        finfo.fsize = 4096;
        assert_eq!(
            fx.server.setup_client(&mut client, Some(&mut finfo)).await,
            Err(AdmitError::RangeNotSatisfiable)
        );
        assert!(client.mount.is_none());
    }

    #[tokio::test]
    async fn test_max_listeners_enforced() {
        let fx = fixture_with(|c| {
            c.mounts.insert(
                "/a.mp3".into(),
                MountConfig {
                    max_listeners: 2,
                    ..MountConfig::default()
                },
            );
        });

        let mut clients = Vec::new();
        for id in 1..=2 {
            let (mut client, _, _) = testing::client(id);
            let mut finfo = FInfo::file("/a.mp3");
            fx.server
                .setup_client(&mut client, Some(&mut finfo))
                .await
                .unwrap();
            clients.push(client);
        }

        let (mut third, _, _) = testing::client(3);
        let mut finfo = FInfo::file("/a.mp3");
        assert_eq!(
            fx.server.setup_client(&mut third, Some(&mut finfo)).await,
            Err(AdmitError::ForbiddenRedirect("/a.mp3".into()))
        );

        let fh = fx.server.cache.find(&FInfo::file("/a.mp3")).await.unwrap();
        assert_eq!(fh.lock_owned().await.refcount, 2);
    }

    #[tokio::test]
    async fn test_zero_max_listeners_refused_without_open() {
        let fx = fixture_with(|c| {
            c.mounts.insert(
                "/a.mp3".into(),
                MountConfig {
                    max_listeners: 0,
                    ..MountConfig::default()
                },
            );
        });
        let (mut client, _, _) = testing::client(1);
        let mut finfo = FInfo::file("/a.mp3");
        assert!(matches!(
            fx.server.setup_client(&mut client, Some(&mut finfo)).await,
            Err(AdmitError::ForbiddenRedirect(_))
        ));
        // nothing was opened
        assert_eq!(fx.server.cache.contains("/a.mp3"), Presence::Missing);
    }

    #[tokio::test]
    async fn test_duplicate_login_refused() {
        let fx = fixture_with(|c| {
            c.mounts.insert(
                "/silence.mp3".into(),
                MountConfig {
                    allow_duplicate_users: false,
                    ..MountConfig::default()
                },
            );
        });

        let (mut first, _, _) = fallback_client(1);
        first.username = Some("alice".into());
        let mut finfo = FInfo::fallback("/silence.mp3", 16_000);
        fx.server
            .setup_client(&mut first, Some(&mut finfo))
            .await
            .unwrap();

        let (mut second, _, _) = fallback_client(2);
        second.username = Some("alice".into());
        let mut finfo = FInfo::fallback("/silence.mp3", 16_000);
        assert_eq!(
            fx.server.setup_client(&mut second, Some(&mut finfo)).await,
            Err(AdmitError::Forbidden("Account already in use"))
        );

        let fh = fx.server.cache.find(&finfo).await.unwrap();
        assert_eq!(fh.lock_owned().await.refcount, 1);
    }

    #[tokio::test]
    async fn test_repeat_admission_attaches_once() {
        let fx = fixture();
        let (mut client, _, _) = fallback_client(1);
        let mut finfo = FInfo::fallback("/silence.mp3", 16_000);
        fx.server
            .setup_client(&mut client, Some(&mut finfo))
            .await
            .unwrap();
        fx.server
            .setup_client(&mut client, Some(&mut finfo))
            .await
            .unwrap();

        let fh = fx.server.cache.find(&finfo).await.unwrap();
        let state = fh.lock_owned().await;
        assert_eq!(state.refcount, 1);
        assert_eq!(state.listeners.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sentinel_attachment_for_error_responses() {
        let fx = fixture();
        let (mut client, _, _) = testing::client(9);
        client.respcode = 404;

        fx.server.setup_client(&mut client, None).await.unwrap();
        let fh = client.handle.clone().unwrap();
        assert!(Arc::ptr_eq(&fh, fx.server.sentinel()));
        // synthetic reference plus ours
        assert_eq!(fh.lock_owned().await.refcount, 2);

        fx.server.release_client(&mut client, &NullRouter).await;
        assert_eq!(fx.server.sentinel().lock_owned().await.refcount, 1);
    }

    #[tokio::test]
    async fn test_adhoc_handle_for_authenticated_errors() {
        let fx = fixture();
        let (mut client, _, _) = testing::client(9);
        client.flags.insert(ClientFlags::AUTHENTICATED);
        client.mount = Some("/gone".into());
        client.respcode = 403;

        fx.server.setup_client(&mut client, None).await.unwrap();
        let fh = client.handle.clone().unwrap();
        assert!(!Arc::ptr_eq(&fh, fx.server.sentinel()));
        {
            let state = fh.lock_owned().await;
            assert!(state.finfo.flags.contains(HandleFlags::DELETE));
            assert_eq!(state.refcount, 1);
            assert!(state.listeners.is_none());
        }
        // not in the cache; release destroys it synchronously
        assert_eq!(fx.server.cache.contains("/gone"), Presence::Missing);
        fx.server.release_client(&mut client, &NullRouter).await;
        assert_eq!(fh.lock_owned().await.refcount, 0);
    }

    // --- throttled streaming --------------------------------------------

    #[tokio::test]
    async fn test_throttle_approximates_limit() {
        let fx = fixture();
        let limit = 16_000u64; // 128 kbit/s
        let (mut client, _, _) = fallback_client(1);
        let mut finfo = FInfo::fallback("/silence.mp3", limit);
        fx.server
            .setup_client(&mut client, Some(&mut finfo))
            .await
            .unwrap();

        let start = WorkerTime { secs: 1_000, millis: 1_000_000 };
        client.timer_start = start.secs;

        let window = 30;
        let sent = run_throttled(&fx.server, &mut client, start, window).await;
        let target = limit * window;
        assert!(
            sent >= target * 9 / 10 && sent <= target * 11 / 10,
            "sent {} outside ±10% of {}",
            sent,
            target
        );
    }

    #[tokio::test]
    async fn test_eof_loops_to_frame_start() {
        let fx = fixture();
        let (mut client, _, _) = fallback_client(1);
        let mut finfo = FInfo::fallback("/silence.mp3", 16_000);
        fx.server
            .setup_client(&mut client, Some(&mut finfo))
            .await
            .unwrap();

        // arm the throttled sender
        let now = WorkerTime { secs: 1_000, millis: 1_000_000 };
        client.timer_start = now.secs;
        assert_eq!(
            fx.server.tick(&mut client, now, &NullRouter).await,
            SendOutcome::Continue
        );
        assert_eq!(client.sender, SenderState::ThrottledFileStream);
        // the junk prefix is skipped from the very first read
        assert_eq!(client.intro_offset, 4);

        // force the next read past the end: the sender wraps to the first
        // frame, not to byte zero
        let fh = client.handle.clone().unwrap();
        let size = fh
            .lock_owned()
            .await
            .media
            .as_ref()
            .unwrap()
            .reader
            .size();
        client.intro_offset = size;
        let now = WorkerTime { secs: 1_001, millis: 1_001_000 };
        assert_eq!(
            fx.server.tick(&mut client, now, &NullRouter).await,
            SendOutcome::Continue
        );
        assert_eq!(client.intro_offset, 4);
    }

    #[tokio::test]
    async fn test_fallback_suppresses_keepalive() {
        let fx = fixture();
        let (mut client, _, _) = testing::client(1);
        client.flags.insert(ClientFlags::AUTHENTICATED | ClientFlags::KEEPALIVE);
        client.connection.sent_bytes = 1;
        let mut finfo = FInfo::fallback("/silence.mp3", 16_000);
        fx.server
            .setup_client(&mut client, Some(&mut finfo))
            .await
            .unwrap();
        assert!(!client.flags.contains(ClientFlags::KEEPALIVE));
    }

    // --- override migration ---------------------------------------------

    struct RejoinRouter {
        server: Arc<FileServer>,
    }

    #[async_trait]
    impl ListenerRouter for RejoinRouter {
        async fn release_listener(
            &self,
            _client: &mut Client,
            _mount: &str,
            _mount_cfg: Option<&MountConfig>,
        ) -> RouteOutcome {
            RouteOutcome::Taken
        }

        async fn move_listener(&self, client: &mut Client, finfo: &FInfo) -> RouteOutcome {
            let Some(dest) = finfo.mount.clone() else {
                return RouteOutcome::Declined;
            };
            let mut f = FInfo::fallback(dest, finfo.limit);
            f.kind = finfo.kind;
            match self.server.setup_client(client, Some(&mut f)).await {
                Ok(()) => RouteOutcome::Taken,
                Err(_) => RouteOutcome::Declined,
            }
        }
    }

    #[tokio::test]
    async fn test_override_migrates_listeners() {
        let fx = fixture();
        let mut finfo = FInfo::fallback("/silence.mp3", 16_000);

        let (mut first, _, _) = fallback_client(7);
        fx.server
            .setup_client(&mut first, Some(&mut finfo.clone()))
            .await
            .unwrap();
        let (mut second, _, _) = fallback_client(13);
        fx.server
            .setup_client(&mut second, Some(&mut finfo))
            .await
            .unwrap();

        let old = fx.server.cache.find(&FInfo::fallback("/silence.mp3", 0)).await;
        let old = old.unwrap();

        assert!(
            fx.server
                .set_override("/silence.mp3", "/other.mp3", FormatKind::Mpeg)
                .await
        );

        // cache now holds a fresh, empty entry under the same key
        let fresh = fx
            .server
            .cache
            .find(&FInfo::fallback("/silence.mp3", 0))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&fresh, &old));
        assert_eq!(fresh.lock_owned().await.refcount, 0);
        {
            let state = old.lock_owned().await;
            assert!(state.finfo.flags.contains(HandleFlags::DELETE));
            assert_eq!(state.finfo.override_to.as_deref(), Some("/other.mp3"));
            assert_eq!(state.refcount, 2);
        }

        // first listener migrates on its next tick
        let router = RejoinRouter {
            server: Arc::clone(&fx.server),
        };
        let now = WorkerTime { secs: 2_000, millis: 2_000_000 };
        assert_eq!(
            fx.server.tick(&mut first, now, &router).await,
            SendOutcome::Continue
        );
        let dest = fx
            .server
            .cache
            .find(&FInfo::fallback("/other.mp3", 0))
            .await
            .unwrap();
        assert_eq!(dest.lock_owned().await.refcount, 1);
        assert_eq!(old.lock_owned().await.refcount, 1);

        // second listener is refused by the router and terminates; the
        // tombstone self-destructs with its last listener
        assert_eq!(
            fx.server.tick(&mut second, now, &NullRouter).await,
            SendOutcome::Terminate
        );
        fx.server.release_client(&mut second, &NullRouter).await;
        assert_eq!(old.lock_owned().await.refcount, 0);

        // the fresh entry is still reachable and empty
        let fresh_again = fx
            .server
            .cache
            .find(&FInfo::fallback("/silence.mp3", 0))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&fresh_again, &fresh));
        assert_eq!(fresh_again.lock_owned().await.refcount, 0);
    }

    // --- admin operations ------------------------------------------------

    #[tokio::test]
    async fn test_kill_client_by_id() {
        let fx = fixture();
        let mut finfo = FInfo::fallback("/silence.mp3", 16_000);
        let (mut seven, _, _) = fallback_client(7);
        fx.server
            .setup_client(&mut seven, Some(&mut finfo.clone()))
            .await
            .unwrap();
        let (mut thirteen, _, _) = fallback_client(13);
        fx.server
            .setup_client(&mut thirteen, Some(&mut finfo))
            .await
            .unwrap();

        let resp = fx
            .server
            .kill_client("fallback-/silence.mp3", Some(13))
            .await
            .unwrap();
        assert!(resp.found);
        assert!(resp.to_xml().contains("<return>1</return>"));

        assert!(thirteen.connection.error());
        assert!(!seven.connection.error());

        let now = WorkerTime { secs: 3_000, millis: 3_000_000 };
        assert_eq!(
            fx.server.tick(&mut thirteen, now, &NullRouter).await,
            SendOutcome::Terminate
        );
        assert_eq!(
            fx.server.tick(&mut seven, now, &NullRouter).await,
            SendOutcome::Continue
        );
    }

    #[tokio::test]
    async fn test_kill_client_requires_id() {
        let fx = fixture();
        assert_eq!(
            fx.server.kill_client("/m", None).await,
            Err(AdminError::BadRequest("id"))
        );
    }

    #[tokio::test]
    async fn test_kill_client_unknown_id() {
        let fx = fixture();
        let resp = fx.server.kill_client("/m", Some(99)).await.unwrap();
        assert!(!resp.found);
        assert!(resp.to_xml().contains("<return>0</return>"));
    }

    #[tokio::test]
    async fn test_list_clients() {
        let fx = fixture();
        let mut finfo = FInfo::fallback("/silence.mp3", 16_000);
        let (mut a, _, _) = fallback_client(1);
        fx.server
            .setup_client(&mut a, Some(&mut finfo.clone()))
            .await
            .unwrap();
        let (mut b, _, _) = fallback_client(2);
        fx.server
            .setup_client(&mut b, Some(&mut finfo))
            .await
            .unwrap();

        let listing = fx
            .server
            .list_clients(&FInfo::fallback("/silence.mp3", 0))
            .await
            .unwrap();
        assert_eq!(listing.listeners.len(), 2);
        let xml = listing.to_xml();
        assert!(xml.contains("mount=\"/silence.mp3\""));
        assert!(xml.contains("<listeners>2</listeners>"));

        assert_eq!(
            fx.server.list_clients(&FInfo::file("/absent")).await,
            Err(AdminError::NoSuchMount("/absent".into()))
        );
    }

    #[tokio::test]
    async fn test_query_count_opens_fallback_on_demand() {
        let fx = fixture();
        let finfo = FInfo::fallback("/silence.mp3", 16_000);
        assert_eq!(fx.server.query_count(&finfo).await, Some(0));

        // the probe-opened handle now exists, idle, with a short expiry
        let fh = fx.server.cache.find(&finfo).await.unwrap();
        let state = fh.lock_owned().await;
        assert!(matches!(state.expire, Expiry::At(_)));
    }

    #[tokio::test]
    async fn test_query_count_plain_miss() {
        let fx = fixture();
        assert_eq!(fx.server.query_count(&FInfo::file("/a.mp3")).await, None);
    }

    // --- release routing --------------------------------------------------

    #[tokio::test]
    async fn test_release_hands_fallback_listener_to_router() {
        let fx = fixture();
        let (mut client, _, _) = fallback_client(1);
        client.uri = Some("/live".into());
        let mut finfo = FInfo::fallback("/silence.mp3", 16_000);
        fx.server
            .setup_client(&mut client, Some(&mut finfo))
            .await
            .unwrap();
        fx.server.listener_joined();

        let router = RejoinRouter {
            server: Arc::clone(&fx.server),
        };
        assert_eq!(
            fx.server.release_client(&mut client, &router).await,
            RouteOutcome::Taken
        );
        assert_eq!(fx.server.listener_count(), 0);

        let fh = fx.server.cache.find(&finfo).await.unwrap();
        assert_eq!(fh.lock_owned().await.refcount, 0);
    }

    #[tokio::test]
    async fn test_release_declined_clears_authentication() {
        let fx = fixture();
        let (mut client, _, _) = fallback_client(1);
        client.uri = Some("/live".into());
        let mut finfo = FInfo::fallback("/silence.mp3", 16_000);
        fx.server
            .setup_client(&mut client, Some(&mut finfo))
            .await
            .unwrap();

        assert_eq!(
            fx.server.release_client(&mut client, &NullRouter).await,
            RouteOutcome::Declined
        );
        assert!(!client.flags.contains(ClientFlags::AUTHENTICATED));
        assert!(client.handle.is_none());
    }

    // --- lifecycle --------------------------------------------------------

    #[tokio::test]
    async fn test_serve_file_refused_when_disabled() {
        let fx = fixture_with(|c| c.fileserve = false);
        let (mut client, _, _) = testing::client(1);
        assert_eq!(
            fx.server.serve_file(&mut client, "/a.mp3").await,
            Err(AdmitError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_shutdown_drains_to_sentinel() {
        let fx = fixture();
        let (mut client, _, _) = testing::client(1);
        fx.server.serve_file(&mut client, "/a.mp3").await.unwrap();
        fx.server.release_client(&mut client, &NullRouter).await;
        assert_eq!(fx.server.cache.len().await, 2);

        fx.server.shutdown().await;
        assert!(!fx.server.is_running());
        assert_eq!(fx.server.cache.len().await, 1);

        // senders observe the stop
        let (mut late, _, _) = fallback_client(2);
        late.handle = Some(Arc::clone(fx.server.sentinel()));
        let now = WorkerTime { secs: 1, millis: 1_000 };
        assert_eq!(
            fx.server.tick(&mut late, now, &NullRouter).await,
            SendOutcome::Terminate
        );
    }
}
