use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::trace;

use parley_protocol::codec::{self, PacketKind};
use parley_protocol::messages::{VoiceConfig, VoiceStateUpdate};
use parley_protocol::types::{ChannelId, Username};
use parley_protocol::voice::seq_newer;

use crate::session::{Session, SessionId};

/// Hard cap on concurrently active speakers per channel.
pub const ACTIVE_SPEAKER_MAX: usize = 32;

/// A member counts as an active speaker for this long after its last frame.
pub const ACTIVE_SPEAKER_WINDOW_MS: i64 = 2_000;

/// Token bucket: capacity and refill rate of the per-sender admission gate.
pub const TOKEN_BUCKET_MAX: i64 = 150;
pub const TOKEN_REFILL_PER_SEC: i64 = 150;

/// A binding with no datagram traffic for this long is garbage.
pub const UDP_BINDING_TTL_MS: i64 = 60_000;

/// Sessions idle on the control socket for this long are evicted.
pub const SESSION_IDLE_EVICT_MS: i64 = 300_000;

/// Sessions in a voice channel with neither control nor datagram traffic
/// for this long are removed from the channel (but stay connected).
pub const VOICE_IDLE_EVICT_MS: i64 = 60_000;

/// Total downstream voice budget fair-shared across active speakers.
const CHANNEL_BITRATE_BUDGET_KBPS: u32 = 512;

/// One authenticated username's datagram endpoint within one voice channel.
/// Counters use atomics because the fan-out path updates them while holding
/// the room lock in shared mode.
pub struct UdpBinding {
    pub endpoint: SocketAddr,
    pub voice_channel: ChannelId,
    pub last_seen_ms: AtomicI64,
    tokens: AtomicI64,
    last_refill_ms: AtomicI64,
    pub highest_seq: AtomicU32,
}

impl UdpBinding {
    pub fn new(endpoint: SocketAddr, voice_channel: ChannelId, now_ms: i64) -> Self {
        Self {
            endpoint,
            voice_channel,
            last_seen_ms: AtomicI64::new(now_ms),
            tokens: AtomicI64::new(TOKEN_BUCKET_MAX),
            last_refill_ms: AtomicI64::new(now_ms),
            highest_seq: AtomicU32::new(0),
        }
    }

    /// Debit one token, refilling first. Returns false when the bucket is
    /// empty and the packet must be dropped.
    ///
    /// The refill advances `last_refill_ms` by the exact millisecond cost of
    /// the minted tokens, never to `now_ms`: stamping the wall clock would
    /// discard the sub-millisecond remainder on every packet and starve a
    /// steady 100 pps sender through accumulated rounding. A gap longer than
    /// one second snaps the clock instead, so silence never banks a burst
    /// beyond the bucket capacity.
    pub fn admit(&self, now_ms: i64) -> bool {
        let mut last = self.last_refill_ms.load(Ordering::Relaxed);
        if now_ms - last > 1_000 {
            self.last_refill_ms.store(now_ms, Ordering::Relaxed);
            last = now_ms;
        }
        let elapsed = now_ms - last;
        if elapsed > 0 {
            let refill = elapsed * TOKEN_REFILL_PER_SEC / 1_000;
            if refill > 0 {
                let cur = self.tokens.load(Ordering::Relaxed);
                self.tokens
                    .store((cur + refill).min(TOKEN_BUCKET_MAX), Ordering::Relaxed);
                self.last_refill_ms
                    .store(last + refill * 1_000 / TOKEN_REFILL_PER_SEC, Ordering::Relaxed);
            }
        }
        let cur = self.tokens.load(Ordering::Relaxed);
        if cur < 1 {
            return false;
        }
        self.tokens.store(cur - 1, Ordering::Relaxed);
        true
    }

    /// Wrap-aware highest-sequence tracking for receiver-report correlation.
    pub fn record_seq(&self, seq: u32) {
        let prev = self.highest_seq.load(Ordering::Relaxed);
        if seq_newer(seq, prev) {
            self.highest_seq.store(seq, Ordering::Relaxed);
        }
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_seen_ms.store(now_ms, Ordering::Relaxed);
    }

    /// A binding counts as a live datagram path while traffic arrived within
    /// the active-speaker window; otherwise receivers fall back to the stream.
    pub fn fresh(&self, now_ms: i64) -> bool {
        self.last_seen_ms.load(Ordering::Relaxed) >= now_ms - ACTIVE_SPEAKER_WINDOW_MS
    }
}

/// The maps guarded together by the room lock. Insertions, removals and
/// re-keying require the exclusive side; everything else reads shared.
/// Lookups under the shared side must use `get` — never an entry API.
#[derive(Default)]
pub struct Room {
    pub sessions: HashMap<SessionId, Arc<Session>>,
    pub voice_channels: HashMap<ChannelId, HashMap<SessionId, Arc<Session>>>,
    pub udp_bindings: HashMap<Username, UdpBinding>,
}

impl Room {
    fn has_other_session_for(&self, username: &Username, except: SessionId) -> bool {
        self.sessions
            .values()
            .any(|s| s.id != except && s.username() == Some(username))
    }
}

/// What changed in a channel, for the membership push: a joiner receives
/// the full member list, everyone else a small delta.
enum RefreshEvent<'a> {
    Join(&'a Username),
    Leave(&'a Username),
    Full,
}

/// Victims collected by sweep phase 1 (shared lock) and executed by
/// phase 2 (exclusive lock).
#[derive(Default)]
pub struct SweepPlan {
    pub dead_sessions: Vec<Arc<Session>>,
    pub voice_idle: Vec<(ChannelId, SessionId)>,
    pub dead_bindings: Vec<Username>,
}

impl SweepPlan {
    pub fn is_empty(&self) -> bool {
        self.dead_sessions.is_empty() && self.voice_idle.is_empty() && self.dead_bindings.is_empty()
    }
}

/// Connection/channel registry and voice bookkeeping. The speaker map sits
/// behind its own short mutex, always taken inside the room lock's read
/// side when both are needed.
pub struct Registry {
    pub room: RwLock<Room>,
    speakers: Mutex<HashMap<ChannelId, HashMap<Username, i64>>>,
    next_session_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            room: RwLock::new(Room::default()),
            speakers: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn session_count(&self) -> usize {
        self.room.read().await.sessions.len()
    }

    pub async fn join_client(&self, session: Arc<Session>) {
        let mut room = self.room.write().await;
        room.sessions.insert(session.id, session);
    }

    /// Remove a session entirely. The username's UDP binding goes with it
    /// unless another session still carries the same username.
    pub async fn leave_client(&self, session: &Arc<Session>) {
        let mut room = self.room.write().await;
        room.sessions.remove(&session.id);

        if let Some(user) = session.username() {
            if !room.has_other_session_for(user, session.id) {
                room.udp_bindings.remove(user);
            }
        }

        if let Some(cid) = session.voice_channel() {
            if let Some(members) = room.voice_channels.get_mut(&cid) {
                members.remove(&session.id);
            }
            let user = session.username().cloned();
            match &user {
                Some(u) => refresh_channel(&room, cid, RefreshEvent::Leave(u)),
                None => refresh_channel(&room, cid, RefreshEvent::Full),
            }
        }
    }

    /// Channel switch with ghost eviction: any other session in the target
    /// channel carrying this username is a stale reconnect and is removed
    /// (and closed) before this one is inserted.
    pub async fn set_voice_channel(
        &self,
        session: &Arc<Session>,
        new_cid: Option<ChannelId>,
        old_cid: Option<ChannelId>,
    ) {
        let mut room = self.room.write().await;
        let user = session.username().cloned();

        if let Some(old) = old_cid {
            if old_cid != new_cid {
                if let Some(members) = room.voice_channels.get_mut(&old) {
                    members.remove(&session.id);
                }
                // A channel change invalidates the endpoint claim.
                if let Some(u) = &user {
                    room.udp_bindings.remove(u);
                }
                match &user {
                    Some(u) => refresh_channel(&room, old, RefreshEvent::Leave(u)),
                    None => refresh_channel(&room, old, RefreshEvent::Full),
                }
            }
        }

        if let Some(new) = new_cid {
            let members = room.voice_channels.entry(new).or_default();
            if let Some(u) = &user {
                let ghosts: Vec<Arc<Session>> = members
                    .values()
                    .filter(|s| s.id != session.id && s.username() == Some(u))
                    .cloned()
                    .collect();
                for ghost in ghosts {
                    members.remove(&ghost.id);
                    ghost.clear_voice_channel();
                    ghost.close();
                    trace!(
                        target: "voice_trace",
                        step = "ghost_evicted",
                        user = %u,
                        cid = new,
                        session = ghost.id,
                    );
                }
            }
            members.insert(session.id, session.clone());
            match &user {
                Some(u) => refresh_channel(&room, new, RefreshEvent::Join(u)),
                None => refresh_channel(&room, new, RefreshEvent::Full),
            }
        }
    }

    /// Accept or reject a `hello` datagram. Only a username with a live
    /// session whose voice channel matches the claim may bind an endpoint.
    pub async fn bind_udp(
        &self,
        username: &Username,
        claimed: ChannelId,
        endpoint: SocketAddr,
        now_ms: i64,
    ) -> Result<(), &'static str> {
        let mut room = self.room.write().await;
        if claimed < 0 {
            room.udp_bindings.remove(username);
            return Err("invalid_channel");
        }
        let mut seen_user = false;
        let mut channel_ok = false;
        for s in room.sessions.values() {
            if s.username() == Some(username) {
                seen_user = true;
                if s.voice_channel() == Some(claimed) {
                    channel_ok = true;
                    break;
                }
            }
        }
        if !seen_user {
            return Err("session_not_found");
        }
        if !channel_ok {
            return Err("channel_mismatch");
        }
        room.udp_bindings
            .insert(username.clone(), UdpBinding::new(endpoint, claimed, now_ms));
        Ok(())
    }

    /// Active-speaker gate: a sender already inside the 2 s window always
    /// passes; a new speaker is admitted only below the channel cap. Passing
    /// stamps the sender's timestamp.
    pub fn admit_speaker(&self, cid: ChannelId, sender: &Username, now_ms: i64) -> bool {
        let mut speakers = self.speakers.lock().unwrap();
        let channel = speakers.entry(cid).or_default();
        let cutoff = now_ms - ACTIVE_SPEAKER_WINDOW_MS;
        let was_active = channel.get(sender).is_some_and(|&t| t >= cutoff);
        if !was_active {
            let active = channel.values().filter(|&&t| t >= cutoff).count();
            if active >= ACTIVE_SPEAKER_MAX {
                return false;
            }
        }
        channel.insert(sender.clone(), now_ms);
        true
    }

    pub fn active_speaker_count(&self, cid: ChannelId, now_ms: i64) -> usize {
        let speakers = self.speakers.lock().unwrap();
        let cutoff = now_ms - ACTIVE_SPEAKER_WINDOW_MS;
        speakers
            .get(&cid)
            .map(|channel| channel.values().filter(|&&t| t >= cutoff).count())
            .unwrap_or(0)
    }

    /// Fair share of the channel budget across active speakers,
    /// floored at 24 and capped at 64 kbps.
    pub fn channel_bitrate_ceiling(&self, cid: ChannelId, now_ms: i64) -> u32 {
        let active = self.active_speaker_count(cid, now_ms).max(1) as u32;
        (CHANNEL_BITRATE_BUDGET_KBPS / active).clamp(24, 64)
    }

    /// Stream-path broadcast: every member of the sender's channel except
    /// the sender, voice drop policy applied per receiver.
    pub async fn broadcast_voice_stream(&self, cid: ChannelId, sender: SessionId, frame: Bytes) {
        let room = self.room.read().await;
        let Some(members) = room.voice_channels.get(&cid) else {
            return;
        };
        for s in members.values() {
            if s.id != sender && s.voice_channel() == Some(cid) {
                s.send(frame.clone(), true);
            }
        }
    }

    /// Control-plane broadcast to every member of a voice channel.
    pub async fn broadcast_voice_channel(&self, cid: ChannelId, frame: Bytes) {
        let room = self.room.read().await;
        let Some(members) = room.voice_channels.get(&cid) else {
            return;
        };
        for s in members.values() {
            s.send(frame.clone(), false);
        }
    }

    /// Control-plane broadcast to every session whose username is in the
    /// given set (the storage layer's answer to "who may see this channel").
    pub async fn broadcast_to_users(&self, users: &HashSet<Username>, frame: Bytes) {
        let room = self.room.read().await;
        for s in room.sessions.values() {
            if let Some(u) = s.username() {
                if users.contains(u) {
                    s.send(frame.clone(), false);
                }
            }
        }
    }

    pub async fn online_usernames(&self) -> HashSet<Username> {
        let room = self.room.read().await;
        room.sessions
            .values()
            .filter_map(|s| s.username().cloned())
            .collect()
    }

    /// Phase 1 of the liveness sweep: collect victims under the shared lock.
    pub async fn collect_sweep(&self, now_ms: i64) -> SweepPlan {
        let mut plan = SweepPlan::default();
        let room = self.room.read().await;

        for session in room.sessions.values() {
            let idle_ms = now_ms - session.last_activity_ms();
            if !session.is_healthy() || idle_ms > SESSION_IDLE_EVICT_MS {
                plan.dead_sessions.push(session.clone());
                continue;
            }
            if let Some(cid) = session.voice_channel() {
                let udp_active = session
                    .username()
                    .and_then(|u| room.udp_bindings.get(u))
                    .is_some_and(|b| {
                        now_ms - b.last_seen_ms.load(Ordering::Relaxed) < VOICE_IDLE_EVICT_MS
                    });
                if idle_ms > VOICE_IDLE_EVICT_MS && !udp_active {
                    plan.voice_idle.push((cid, session.id));
                }
            }
        }

        let cutoff = now_ms - UDP_BINDING_TTL_MS;
        for (user, binding) in &room.udp_bindings {
            if binding.last_seen_ms.load(Ordering::Relaxed) < cutoff || binding.voice_channel < 0 {
                plan.dead_bindings.push(user.clone());
            }
        }

        plan
    }

    /// Phase 2: execute exactly the removals collected in phase 1 under the
    /// exclusive lock.
    pub async fn apply_sweep(&self, plan: SweepPlan) {
        if plan.is_empty() {
            return;
        }
        let mut room = self.room.write().await;

        for session in plan.dead_sessions {
            session.close();
            room.sessions.remove(&session.id);

            if let Some(cid) = session.voice_channel() {
                if let Some(members) = room.voice_channels.get_mut(&cid) {
                    members.remove(&session.id);
                }
                session.clear_voice_channel();
                refresh_channel(&room, cid, RefreshEvent::Full);
            }

            if let Some(user) = session.username() {
                if !room.has_other_session_for(user, session.id) {
                    room.udp_bindings.remove(user);
                }
            }
            trace!(target: "voice_trace", step = "sweep_evict", session = session.id);
        }

        for (cid, session_id) in plan.voice_idle {
            let removed = room
                .voice_channels
                .get_mut(&cid)
                .and_then(|members| members.remove(&session_id));
            if let Some(session) = removed {
                session.clear_voice_channel();
                refresh_channel(&room, cid, RefreshEvent::Full);
                trace!(target: "voice_trace", step = "voice_idle_evict", session = session_id, cid);
            }
        }

        for user in plan.dead_bindings {
            room.udp_bindings.remove(&user);
        }
    }

    /// Drop every voice channel whose membership set is empty, along with
    /// its active-speaker entry.
    pub async fn gc_empty_channels(&self) {
        let mut room = self.room.write().await;
        let mut speakers = self.speakers.lock().unwrap();
        room.voice_channels.retain(|cid, members| {
            let keep = !members.is_empty();
            if !keep {
                speakers.remove(cid);
            }
            keep
        });
    }

    /// Request teardown of every session. Used by the shutdown path; safe
    /// to call repeatedly (a second termination signal drains the same set).
    pub async fn close_all_sessions(&self) {
        let room = self.room.read().await;
        for session in room.sessions.values() {
            session.close();
        }
    }
}

/// Recompute and push membership + voice configuration for one channel.
/// Must be called with the room lock held (either mode); sends are
/// non-blocking so the lock is never held across I/O suspension.
fn refresh_channel(room: &Room, cid: ChannelId, event: RefreshEvent<'_>) {
    let Some(members) = room.voice_channels.get(&cid) else {
        return;
    };
    let count = members.len();
    for s in members.values() {
        s.set_voice_load(count);
    }

    let config_frame = json_frame(
        PacketKind::VoiceConfig,
        &VoiceConfig::scaled(count),
    );

    let full_frame = || {
        json_frame(
            PacketKind::VoiceStateUpdate,
            &VoiceStateUpdate {
                cid,
                members: Some(
                    members
                        .values()
                        .filter_map(|s| s.username().cloned())
                        .collect(),
                ),
                u: None,
                action: None,
            },
        )
    };
    let delta_frame = |user: &Username, action: &str| {
        json_frame(
            PacketKind::VoiceStateUpdate,
            &VoiceStateUpdate {
                cid,
                members: None,
                u: Some(user.clone()),
                action: Some(action.into()),
            },
        )
    };

    match event {
        RefreshEvent::Join(user) => {
            let full = full_frame();
            let delta = delta_frame(user, "join");
            for s in members.values() {
                let frame = if s.username() == Some(user) {
                    full.clone()
                } else {
                    delta.clone()
                };
                s.send(frame, false);
                s.send(config_frame.clone(), false);
            }
        }
        RefreshEvent::Leave(user) => {
            let delta = delta_frame(user, "leave");
            for s in members.values() {
                s.send(delta.clone(), false);
                s.send(config_frame.clone(), false);
            }
        }
        RefreshEvent::Full => {
            let full = full_frame();
            for s in members.values() {
                s.send(full.clone(), false);
                s.send(config_frame.clone(), false);
            }
        }
    }
}

fn json_frame<T: serde::Serialize>(kind: PacketKind, body: &T) -> Bytes {
    // The bodies built here serialize infallibly.
    Bytes::from(codec::encode_json(kind, body).unwrap_or_else(|_| codec::encode(kind, b"{}")))
}
