//! Sender state machine
//!
//! Every listener is driven by one of three senders: intro-buffer drain,
//! plain file streaming, or bitrate-throttled streaming. Workers call
//! [`FileServer::tick`] once per scheduling round; transitions happen
//! between ticks, never mid-write. Migration to an override target is an
//! action taken from inside a tick, not a fourth resident state.

use crate::cache::{FInfo, HandleFlags};
use crate::client::{Client, ClientFlags, SenderState, WorkerTime, WriteOutcome};
use crate::media::{self, FileRead, MediaSource};
use crate::serve::{FileServer, ListenerRouter, RouteOutcome};
use std::sync::Arc;

/// Per-tick iteration and byte caps for the intro sender.
const INTRO_LOOPS: u32 = 8;
const INTRO_BYTE_CAP: usize = 30_000;

/// Per-tick iteration and byte caps for the fast file sender.
const FILE_LOOPS: u32 = 6;
const FILE_BYTE_CAP: usize = 48_000;

/// Bytes a throttled listener may send before pacing kicks in.
const INITIAL_ALLOWANCE: u64 = 8192;

/// Floor for computed reschedule delays.
const MIN_DELAY_MS: u64 = 50;

/// What the worker should do with the listener after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Keep the listener; tick again once `schedule_ms` is reached.
    Continue,
    /// The listener is finished or failed; release and destroy it.
    Terminate,
}

/// Snapshot of the shared handle taken under its lock once per decision
/// point, so no lock is held across reads or socket writes.
struct HandleView {
    pending_override: bool,
    media: Option<Arc<MediaSource>>,
    limit: u64,
}

impl FileServer {
    /// Run one sender tick for `client`.
    ///
    /// The worker owns scheduling: after `Continue`, the client should not
    /// be ticked again before `client.schedule_ms`.
    pub async fn tick(
        &self,
        client: &mut Client,
        now: WorkerTime,
        router: &dyn ListenerRouter,
    ) -> SendOutcome {
        match client.sender {
            SenderState::Intro => self.intro_send(client, now, router).await,
            SenderState::FileStream => self.file_send(client, now).await,
            SenderState::ThrottledFileStream => self.throttled_send(client, now, router).await,
        }
    }

    async fn handle_view(&self, client: &Client) -> HandleView {
        match &client.handle {
            Some(fh) => {
                let state = fh.lock_owned().await;
                HandleView {
                    pending_override: state.finfo.override_to.is_some(),
                    media: state.media.clone(),
                    limit: state.finfo.limit,
                }
            }
            None => HandleView {
                pending_override: false,
                media: None,
                limit: 0,
            },
        }
    }

    /// Drain the in-memory intro/header chain, then hand off to a file
    /// sender (or finish, for clients with nothing behind the buffers).
    async fn intro_send(
        &self,
        client: &mut Client,
        now: WorkerTime,
        router: &dyn ListenerRouter,
    ) -> SendOutcome {
        let mut written = 0usize;
        for _ in 0..INTRO_LOOPS {
            if !self.is_running() || client.connection.error() {
                return SendOutcome::Terminate;
            }

            let exhausted = client.intro_front_remaining().map_or(true, |r| r == 0);
            if exhausted {
                let view = self.handle_view(client).await;
                if view.pending_override && client.flags.contains(ClientFlags::AUTHENTICATED) {
                    return self.move_listener(client, router).await;
                }
                if client.intro_has_next() {
                    client.advance_intro();
                } else {
                    if !client.flags.contains(ClientFlags::AUTHENTICATED) {
                        return SendOutcome::Terminate;
                    }
                    if let Some(media) = view.media {
                        client.clear_intro();
                        client.intro_offset =
                            media.frame_start_pos + client.connection.start_pos;
                        if view.limit > 0 {
                            client.sender = SenderState::ThrottledFileStream;
                            if let Some(fh) = &client.handle {
                                fh.lock_owned().await.out_bitrate.add(0, now.millis);
                            }
                            return SendOutcome::Continue;
                        }
                        client.sender = SenderState::FileStream;
                        return self.file_send(client, now).await;
                    }
                    // nothing queued and no file behind it: the response
                    // (error page or headers-only) is complete
                    return SendOutcome::Terminate;
                }
            }

            match client.write_intro_front() {
                WriteOutcome::Wrote(n) => {
                    if n > 0 {
                        written += n;
                        self.global_rate_add(n as u64, now.millis);
                    }
                    if written > INTRO_BYTE_CAP {
                        break;
                    }
                }
                WriteOutcome::Blocked => {
                    client.schedule_ms = now.millis + if written > 0 { 150 } else { 300 };
                    break;
                }
            }
        }
        SendOutcome::Continue
    }

    /// Fast path for untimed files: read and write until the per-tick caps,
    /// the range end, or backpressure.
    async fn file_send(&self, client: &mut Client, now: WorkerTime) -> SendOutcome {
        let mut loops = FILE_LOOPS;
        let mut written = 0usize;
        client.schedule_ms = now.millis;

        // slow down when the server-wide bandwidth ceiling is exceeded, but
        // let short-lived connections through at full speed
        if self.send_pressure() > 1 && now.secs.saturating_sub(client.connection.con_time) > 1 {
            client.schedule_ms += 300;
            loops = 1;
        }

        let view = self.handle_view(client).await;
        let Some(media) = view.media else {
            return SendOutcome::Terminate;
        };

        while loops > 0 && written < FILE_BYTE_CAP {
            loops -= 1;
            if !self.is_running() || client.connection.error() {
                return SendOutcome::Terminate;
            }
            match media::file_read(&media, client, false) {
                FileRead::Eof | FileRead::Failed => return SendOutcome::Terminate,
                FileRead::Filled => {}
            }
            match client.write_pending() {
                WriteOutcome::Blocked => {
                    client.schedule_ms += if written > 0 { 80 } else { 150 };
                    return SendOutcome::Continue;
                }
                WriteOutcome::Wrote(n) => written += n,
            }
        }
        client.schedule_ms += 4;
        SendOutcome::Continue
    }

    /// Paced sender for fallback and on-demand files with a target bitrate.
    /// Loops the file at end-of-file by seeking back to the first frame.
    async fn throttled_send(
        &self,
        client: &mut Client,
        now: WorkerTime,
        router: &dyn ListenerRouter,
    ) -> SendOutcome {
        if !self.is_running() || client.connection.error() {
            return SendOutcome::Terminate;
        }
        let secs = now.secs.saturating_sub(client.timer_start);
        client.schedule_ms = now.millis;

        let view = self.handle_view(client).await;
        if view.pending_override {
            return self.move_listener(client, router).await;
        }
        let Some(media) = view.media else {
            return SendOutcome::Terminate;
        };

        let mut limit = view.limit;
        if client.flags.contains(ClientFlags::WANTS_FLV) {
            // wrapping overhead eats into the budget
            limit = (limit as f64 * 1.01) as u64;
        }
        let unit = media::THROTTLE_BLOCK as u64;
        let rate = if secs > 0 {
            (client.counter + unit) / secs
        } else {
            limit * 2
        };

        if rate > limit {
            client.schedule_ms += if limit >= unit {
                (1000 / (limit / unit)).max(MIN_DELAY_MS)
            } else {
                MIN_DELAY_MS
            };
            if let Some(fh) = &client.handle {
                fh.lock_owned().await.out_bitrate.add(0, now.millis);
            }
            self.global_rate_add(0, now.millis);
            if client.counter > INITIAL_ALLOWANCE {
                return SendOutcome::Continue;
            }
        }

        match media::file_read(&media, client, true) {
            FileRead::Eof => {
                client.intro_offset = media.frame_start_pos;
                client.schedule_ms += if client.throttle > 0 {
                    client.throttle
                } else {
                    150
                };
                return SendOutcome::Continue;
            }
            FileRead::Failed => return SendOutcome::Terminate,
            FileRead::Filled => {}
        }

        let bytes = match client.write_pending() {
            WriteOutcome::Wrote(n) => n as u64,
            WriteOutcome::Blocked => 0,
        };
        if let Some(fh) = &client.handle {
            fh.lock_owned().await.out_bitrate.add(bytes, now.millis);
        }
        self.global_rate_add(bytes, now.millis);

        client.schedule_ms += if limit >= unit * 2 {
            (1000 / (limit / unit * 2)).max(MIN_DELAY_MS)
        } else {
            MIN_DELAY_MS
        };
        if self.send_pressure() > 1 {
            client.schedule_ms += 300;
        }
        SendOutcome::Continue
    }

    /// Migrate the listener onto its handle's override target. On success
    /// the listener has already been attached to the new mount by the
    /// router; we only detach it here. On refusal the listener terminates,
    /// which lets a tombstoned handle reach zero and self-destruct.
    async fn move_listener(
        &self,
        client: &mut Client,
        router: &dyn ListenerRouter,
    ) -> SendOutcome {
        let Some(fh) = client.handle.clone() else {
            return SendOutcome::Terminate;
        };
        let (finfo, from_mount, from_flags) = {
            let state = fh.lock_owned().await;
            let finfo = FInfo {
                mount: state.finfo.override_to.clone(),
                flags: state.finfo.flags & !HandleFlags::DELETE,
                limit: state.finfo.limit,
                kind: state.finfo.kind,
                fsize: 0,
                override_to: None,
            };
            (
                finfo,
                state.finfo.mount.clone().unwrap_or_default(),
                state.finfo.flags,
            )
        };

        if client.intro_front_remaining().map_or(false, |r| r > 0) {
            // partial write in flight; the new mount must complete it
            client.flags.insert(ClientFlags::HAS_INTRO_CONTENT);
        } else {
            client.clear_intro();
        }

        match router.move_listener(client, &finfo).await {
            RouteOutcome::Declined => {
                tracing::warn!(mount = %from_mount, "move failed, terminating listener");
                SendOutcome::Terminate
            }
            RouteOutcome::Taken => {
                tracing::debug!(
                    ip = %client.connection.ip,
                    from = %from_mount,
                    flags = from_flags.bits(),
                    "moved listener"
                );
                let now = WorkerTime::now();
                self.detach_handle(&fh, client.connection.id, now.secs).await;
                SendOutcome::Continue
            }
        }
    }
}
