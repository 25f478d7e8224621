//! Per-session packet pipeline: exact-length reads, then a per-kind
//! dispatcher. Errors returned from `handle_packet` tear the session down;
//! everything else (auth failures, rate limits, storage trouble) answers or
//! drops locally and keeps the session alive.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use parley_protocol::codec::{self, Header, PacketKind, HEADER_SIZE, MAX_BODY_SIZE};
use parley_protocol::messages::*;
use parley_protocol::types::Username;
use parley_protocol::voice::{NetworkState, ReceiverReport, SenderReport, VoicePayload};

use crate::clock;
use crate::config::ServerConfig;
use crate::session::{run_writer, Session};
use crate::state::Registry;
use crate::stats::Telemetry;
use crate::storage::{LoginOutcome, RegisterOutcome, StorageBridge};

/// Everything a connection handler needs, shared across the server.
pub struct ServerCtx {
    pub registry: Arc<Registry>,
    pub storage: StorageBridge,
    pub stats: Arc<Telemetry>,
    pub config: ServerConfig,
}

/// Stream-path voice admission: at most this many frames per window.
pub const VOICE_WINDOW_LIMIT: u32 = 100;
pub const VOICE_WINDOW_MS: i64 = 1_000;

/// Rolling 1-second / 100-packet window for stream-path voice.
///
/// The elapsed time is measured against the current window start *before*
/// anything is reset; the window only advances when it has expired. Stamping
/// the start on every packet would keep `elapsed` near zero and the counter
/// forever fresh, turning the limiter off.
#[derive(Debug, Clone, Copy)]
pub struct VoiceWindow {
    start_ms: i64,
    count: u32,
}

impl VoiceWindow {
    pub fn new(now_ms: i64) -> Self {
        Self {
            start_ms: now_ms,
            count: 0,
        }
    }

    pub fn admit(&mut self, now_ms: i64) -> bool {
        if now_ms - self.start_ms >= VOICE_WINDOW_MS {
            self.start_ms = now_ms;
            self.count = 0;
        }
        self.count += 1;
        self.count <= VOICE_WINDOW_LIMIT
    }
}

/// Per-sender adaptive bitrate state, driven by receiver reports.
#[derive(Debug, Clone, Copy)]
pub struct ControlState {
    pub assigned_bitrate_kbps: u32,
    stable_reports: u32,
    last_jitter_ms: f64,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            assigned_bitrate_kbps: 48,
            stable_reports: 0,
            last_jitter_ms: 0.0,
        }
    }
}

impl ControlState {
    /// Loss or a jitter spike halves the assignment (floor 16); three
    /// consecutive clean reports buy 4 kbps back (cap 64); anything in
    /// between resets the streak.
    pub fn on_report(&mut self, report: &ReceiverReport) -> NetworkState {
        let gradient = f64::from(report.jitter_ms) - self.last_jitter_ms;
        self.last_jitter_ms = f64::from(report.jitter_ms);

        if report.fraction_lost > 10 || gradient > 30.0 {
            self.assigned_bitrate_kbps = (self.assigned_bitrate_kbps / 2).max(16);
            self.stable_reports = 0;
            NetworkState::Critical
        } else if report.fraction_lost == 0 && gradient < 10.0 && report.jitter_ms < 60 {
            self.stable_reports += 1;
            if self.stable_reports >= 3 {
                self.assigned_bitrate_kbps = (self.assigned_bitrate_kbps + 4).min(64);
                self.stable_reports = 0;
            }
            NetworkState::Stable
        } else {
            self.stable_reports = 0;
            NetworkState::Degraded
        }
    }
}

/// In-progress attachment upload. An unfinished sink is deleted when the
/// session goes away.
struct UploadSink {
    id: String,
    path: PathBuf,
    target: u64,
    written: u64,
    file: tokio::fs::File,
}

/// Connection-local state: only the reader task touches it, so none of it
/// needs locking.
struct ConnState {
    upload: Option<UploadSink>,
    pending_hwid: String,
    pending_2fa_user: Option<Username>,
    voice_window: VoiceWindow,
    control: ControlState,
}

impl ConnState {
    fn new() -> Self {
        Self {
            upload: None,
            pending_hwid: String::new(),
            pending_2fa_user: None,
            voice_window: VoiceWindow::new(clock::now_ms()),
            control: ControlState::default(),
        }
    }
}

/// Drive one client connection to completion.
pub async fn run_connection(stream: TcpStream, ctx: Arc<ServerCtx>) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(_) => return,
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, "failed to set NODELAY: {e}");
    }
    let (mut reader, writer_half) = stream.into_split();

    let id = ctx.registry.next_session_id();
    let (session, outbound_rx) = Session::new(id, peer);
    let writer = tokio::spawn(run_writer(writer_half, outbound_rx, session.clone()));
    ctx.registry.join_client(session.clone()).await;
    info!(peer = %peer, session = id, "client connected");

    let mut conn = ConnState::new();
    loop {
        let packet = tokio::select! {
            _ = session.wait_closed() => break,
            packet = read_packet(&mut reader) => packet,
        };
        let (header, body) = match packet {
            Ok(packet) => packet,
            Err(e) => {
                debug!(session = id, "read pipeline ended: {e}");
                break;
            }
        };
        if let Err(e) = handle_packet(&ctx, &session, &mut conn, header, body).await {
            debug!(session = id, "tearing down session: {e}");
            break;
        }
    }

    // Partial uploads do not outlive the session.
    if let Some(upload) = conn.upload.take() {
        if upload.written < upload.target {
            drop(upload.file);
            let _ = tokio::fs::remove_file(&upload.path).await;
        }
    }
    ctx.registry.leave_client(&session).await;
    session.close();
    writer.abort();
    info!(session = id, "client disconnected");
}

/// Read exactly one packet: 5-byte header, validation, then the body.
async fn read_packet(reader: &mut OwnedReadHalf) -> anyhow::Result<(Header, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = codec::decode_header(&header_buf)?;
    let mut body = vec![0u8; header.size as usize];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

/// Dispatch one decoded packet. `Err` means the session must die.
async fn handle_packet(
    ctx: &Arc<ServerCtx>,
    session: &Arc<Session>,
    conn: &mut ConnState,
    header: Header,
    body: Vec<u8>,
) -> anyhow::Result<()> {
    session.touch_activity();

    // Raw-body kinds first; they bypass the JSON auth gate.
    match header.kind {
        PacketKind::VoiceDataOpus | PacketKind::VoiceData => {
            return handle_stream_voice(ctx, session, conn, header.kind, body).await;
        }
        PacketKind::EchoRequest => {
            session.send_packet(PacketKind::EchoResponse, &body);
            return Ok(());
        }
        PacketKind::ReceiverReport => {
            return handle_receiver_report(ctx, session, conn, &body);
        }
        PacketKind::FileTransferChunk => {
            return handle_file_chunk(conn, &body).await;
        }
        _ => {}
    }

    // A session without a username may only speak the authentication set.
    if !header.kind.is_auth_exempt() && session.username().is_none() {
        return Ok(());
    }

    match header.kind {
        PacketKind::RegisterRequest => handle_register(ctx, session, &body).await,
        PacketKind::LoginRequest => handle_login(ctx, session, conn, &body).await,
        PacketKind::ValidateSessionRequest => handle_validate_session(ctx, session, &body).await,
        PacketKind::Submit2faLoginRequest => handle_submit_2fa(ctx, session, conn, &body).await,

        PacketKind::CreateServerRequest => {
            let req: CreateServerRequest = parse_json(&body)?;
            let user = current_user(session);
            let servers = ctx
                .storage
                .query(move |db| {
                    db.create_server(&req.name, &user);
                    db.user_servers_json(&user)
                })
                .await;
            if let Some(servers) = storage_ok(servers) {
                session.send_packet(PacketKind::ServerListResponse, servers.as_bytes());
            }
            Ok(())
        }
        PacketKind::JoinServerRequest => {
            let req: JoinServerRequest = parse_json(&body)?;
            let user = current_user(session);
            let servers = ctx
                .storage
                .query(move |db| {
                    db.join_server(&user, &req.code);
                    db.user_servers_json(&user)
                })
                .await;
            if let Some(servers) = storage_ok(servers) {
                session.send_packet(PacketKind::ServerListResponse, servers.as_bytes());
            }
            Ok(())
        }
        PacketKind::GetServerContentRequest => {
            let req: GetServerContentRequest = parse_json(&body)?;
            let content = ctx
                .storage
                .query(move |db| db.server_content_json(req.sid))
                .await;
            if let Some(content) = storage_ok(content) {
                session.send_packet(PacketKind::ServerContentResponse, content.as_bytes());
            }
            Ok(())
        }
        PacketKind::CreateChannelRequest => {
            let req: CreateChannelRequest = parse_json(&body)?;
            let content = ctx
                .storage
                .query(move |db| {
                    db.create_channel(req.sid, &req.name, &req.kind);
                    db.server_content_json(req.sid)
                })
                .await;
            if let Some(content) = storage_ok(content) {
                session.send_packet(PacketKind::ServerContentResponse, content.as_bytes());
            }
            Ok(())
        }
        PacketKind::DeleteChannelRequest => {
            let req: DeleteChannelRequest = parse_json(&body)?;
            let user = current_user(session);
            let content = ctx
                .storage
                .query(move |db| {
                    db.delete_channel(req.cid, &user)
                        .then(|| db.server_content_json(req.sid))
                })
                .await;
            if let Some(Some(content)) = storage_ok(content) {
                session.send_packet(PacketKind::ServerContentResponse, content.as_bytes());
            }
            Ok(())
        }
        PacketKind::SelectTextChannel => {
            let req: SelectTextChannel = parse_json(&body)?;
            let history = ctx
                .storage
                .query(move |db| db.message_history_json(req.cid))
                .await;
            if let Some(history) = storage_ok(history) {
                session.send_packet(PacketKind::MessageHistoryResponse, history.as_bytes());
            }
            Ok(())
        }

        PacketKind::JoinVoiceChannel => {
            let req: JoinVoiceChannel = parse_json(&body)?;
            let new_cid = (req.cid >= 0).then_some(req.cid);
            let old_cid = session.swap_voice_channel(new_cid);
            conn.voice_window = VoiceWindow::new(clock::now_ms());
            ctx.registry.set_voice_channel(session, new_cid, old_cid).await;
            Ok(())
        }

        PacketKind::MessageText => handle_message_text(ctx, session, &body).await,
        PacketKind::DeleteMessageRequest => {
            let req: DeleteMessageRequest = parse_json(&body)?;
            let (mid, cid) = (req.mid, req.cid);
            let user = current_user(session);
            let result = ctx
                .storage
                .query(move |db| {
                    db.delete_message(mid, cid, &user)
                        .then(|| db.users_in_server_by_channel(cid))
                })
                .await;
            if let Some(Some(members)) = storage_ok(result) {
                let frame = json_frame(PacketKind::MessageDelete, &MessageDeleted { mid, cid })?;
                broadcast(ctx, members, frame).await;
            }
            Ok(())
        }
        PacketKind::EditMessageRequest => {
            let req: EditMessageRequest = parse_json(&body)?;
            let user = current_user(session);
            let result = ctx
                .storage
                .query(move |db| {
                    db.edit_message(req.mid, &user, &req.msg).then(|| {
                        (
                            db.message_history_json(req.cid),
                            db.users_in_server_by_channel(req.cid),
                        )
                    })
                })
                .await;
            if let Some(Some((history, members))) = storage_ok(result) {
                let frame = Bytes::from(codec::encode(
                    PacketKind::MessageHistoryResponse,
                    history.as_bytes(),
                ));
                broadcast(ctx, members, frame).await;
            }
            Ok(())
        }
        PacketKind::PinMessageRequest => {
            let req: PinMessageRequest = parse_json(&body)?;
            let user = current_user(session);
            let result = ctx
                .storage
                .query(move |db| {
                    db.pin_message(req.mid, req.cid, &user, req.pin).then(|| {
                        (
                            db.message_history_json(req.cid),
                            db.users_in_server_by_channel(req.cid),
                        )
                    })
                })
                .await;
            if let Some(Some((history, members))) = storage_ok(result) {
                let frame = Bytes::from(codec::encode(
                    PacketKind::MessageHistoryResponse,
                    history.as_bytes(),
                ));
                broadcast(ctx, members, frame).await;
            }
            Ok(())
        }

        PacketKind::MemberListRequest => {
            let req: MemberListRequest = parse_json(&body)?;
            let members = ctx.storage.query(move |db| db.server_members(req.sid)).await;
            if let Some(members) = storage_ok(members) {
                let online = ctx.registry.online_usernames().await;
                let entries: Vec<MemberEntry> = members
                    .into_iter()
                    .map(|u| MemberEntry {
                        online: online.contains(&u),
                        u,
                    })
                    .collect();
                session.send_json(PacketKind::MemberListResponse, &entries);
            }
            Ok(())
        }

        PacketKind::VoiceMuteState => {
            let req: VoiceMuteStateIn = parse_json(&body)?;
            let Some(cid) = session.voice_channel() else {
                return Ok(());
            };
            let frame = json_frame(
                PacketKind::VoiceMuteState,
                &VoiceMuteStateOut {
                    u: current_user(session),
                    muted: req.muted,
                    deafened: req.deafened,
                    cid,
                },
            )?;
            ctx.registry.broadcast_voice_channel(cid, frame).await;
            Ok(())
        }

        PacketKind::VoiceStatsReport => {
            let req: VoiceStatsReport = parse_json(&body)?;
            ctx.stats.record_client_stats(
                &current_user(session),
                req.cid,
                req.ping_ms,
                req.loss_pct,
                req.jitter_ms,
                req.buffer_ms,
            );
            Ok(())
        }

        PacketKind::FileTransferRequest => handle_file_request(ctx, session, conn, &body).await,
        PacketKind::FileTransferComplete => {
            if let Some(mut upload) = conn.upload.take() {
                let _ = upload.file.flush().await;
                session.send_json(
                    PacketKind::FileTransferComplete,
                    &FileTransferReply {
                        action: "upload_finished",
                        id: upload.id,
                    },
                );
            }
            Ok(())
        }

        // Server-to-client kinds arriving inbound carry no meaning; ignore.
        _ => Ok(()),
    }
}

async fn handle_stream_voice(
    ctx: &Arc<ServerCtx>,
    session: &Arc<Session>,
    conn: &mut ConnState,
    kind: PacketKind,
    body: Vec<u8>,
) -> anyhow::Result<()> {
    let Some(cid) = session.voice_channel() else {
        return Ok(());
    };
    let now = clock::now_ms();
    if !conn.voice_window.admit(now) {
        trace!(
            target: "voice_trace",
            step = "stream_drop",
            reason = "rate_limited",
            session = session.id,
        );
        return Ok(());
    }
    // Stream-relayed frames occupy the same downstream budget as datagram
    // frames, so they count toward the active-speaker window too.
    if kind == PacketKind::VoiceDataOpus && VoicePayload::decode(&body).is_ok() {
        if let Some(user) = session.username() {
            ctx.registry.admit_speaker(cid, user, now);
        }
    }
    let frame = Bytes::from(codec::encode(kind, &body));
    ctx.registry.broadcast_voice_stream(cid, session.id, frame).await;
    Ok(())
}

fn handle_receiver_report(
    ctx: &Arc<ServerCtx>,
    session: &Arc<Session>,
    conn: &mut ConnState,
    body: &[u8],
) -> anyhow::Result<()> {
    let Ok(report) = ReceiverReport::decode(body) else {
        return Ok(());
    };
    let state = conn.control.on_report(&report);
    let cid = session.voice_channel().unwrap_or(-1);
    let ceiling = ctx.registry.channel_bitrate_ceiling(cid, clock::now_ms());

    if let Some(user) = session.username() {
        ctx.stats
            .record_receiver_report(user, cid, report.loss_pct(), report.jitter_ms as f32);
    }

    let reply = SenderReport {
        suggested_bitrate_kbps: conn.control.assigned_bitrate_kbps.min(ceiling),
        estimated_rtt_ms: 0,
        network_state: state,
    };
    session.send_packet(PacketKind::SenderReport, &reply.encode());
    Ok(())
}

async fn handle_file_chunk(conn: &mut ConnState, body: &[u8]) -> anyhow::Result<()> {
    let Some(upload) = conn.upload.as_mut() else {
        return Ok(());
    };
    if upload.written + body.len() as u64 > upload.target {
        bail!("upload exceeded its declared size");
    }
    upload
        .file
        .write_all(body)
        .await
        .context("attachment write failed")?;
    upload.written += body.len() as u64;
    Ok(())
}

async fn handle_file_request(
    ctx: &Arc<ServerCtx>,
    session: &Arc<Session>,
    conn: &mut ConnState,
    body: &[u8],
) -> anyhow::Result<()> {
    let req: FileTransferRequest = parse_json(body)?;
    conn.upload = None;
    if req.size > u64::from(MAX_BODY_SIZE) {
        return Ok(());
    }

    let id = format!(
        "{}_{:08x}_{}",
        clock::unix_ts(),
        rand::random::<u32>(),
        sanitize_filename(&req.filename)
    );
    let dir = PathBuf::from(&ctx.config.attachments_dir);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!("cannot create attachments dir: {e}");
        return Ok(());
    }
    let path = dir.join(&id);
    let file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("cannot open attachment sink: {e}");
            return Ok(());
        }
    };
    conn.upload = Some(UploadSink {
        id: id.clone(),
        path,
        target: req.size,
        written: 0,
        file,
    });
    session.send_json(
        PacketKind::FileTransferComplete,
        &FileTransferReply {
            action: "upload_approved",
            id,
        },
    );
    Ok(())
}

async fn handle_register(
    ctx: &Arc<ServerCtx>,
    session: &Arc<Session>,
    body: &[u8],
) -> anyhow::Result<()> {
    let req: RegisterRequest = parse_json(body)?;
    let result = ctx
        .storage
        .query(move |db| match db.register(&req.e, &req.u, &req.p) {
            RegisterOutcome::Created(username) => {
                db.add_user_to_default_server(&username);
                let servers = db.user_servers_json(&username);
                Some((username, servers))
            }
            RegisterOutcome::Taken => None,
        })
        .await;
    match storage_ok(result) {
        Some(Some((username, servers))) => {
            session.set_username(username.clone());
            session.send_json(PacketKind::RegisterSuccess, &RegisterSuccess { u: username });
            session.send_packet(PacketKind::ServerListResponse, servers.as_bytes());
        }
        _ => {
            session.send_packet(PacketKind::RegisterFailed, b"");
        }
    }
    Ok(())
}

async fn handle_login(
    ctx: &Arc<ServerCtx>,
    session: &Arc<Session>,
    conn: &mut ConnState,
    body: &[u8],
) -> anyhow::Result<()> {
    let req: LoginRequest = parse_json(body)?;
    let hwid = req.hwid.clone();
    let result = ctx
        .storage
        .query(move |db| {
            let outcome = db.login(&req.e, &req.p, &req.hwid);
            let servers = match &outcome {
                LoginOutcome::Success { username, .. } => Some(db.user_servers_json(username)),
                _ => None,
            };
            (outcome, servers)
        })
        .await;
    match storage_ok(result) {
        Some((LoginOutcome::Success { username, has_2fa }, servers)) => {
            session.set_username(username.clone());
            session.send_json(
                PacketKind::LoginSuccess,
                &LoginSuccess {
                    u: username,
                    two_fa_enabled: has_2fa,
                },
            );
            if let Some(servers) = servers {
                session.send_packet(PacketKind::ServerListResponse, servers.as_bytes());
            }
        }
        Some((LoginOutcome::Needs2Fa { username }, _)) => {
            // The attempt carries a hardware id that becomes trusted once
            // the second factor checks out; the session stays unauthenticated.
            conn.pending_hwid = hwid;
            conn.pending_2fa_user = Some(username.clone());
            session.send_json(PacketKind::LoginRequires2fa, &LoginRequires2fa { u: username });
        }
        _ => {
            session.send_packet(PacketKind::LoginFailed, b"");
        }
    }
    Ok(())
}

async fn handle_validate_session(
    ctx: &Arc<ServerCtx>,
    session: &Arc<Session>,
    body: &[u8],
) -> anyhow::Result<()> {
    let req: ValidateSessionRequest = parse_json(body)?;
    let result = ctx
        .storage
        .query(move |db| {
            db.validate_session(&req.e, &req.ph)
                .map(|username| {
                    let servers = db.user_servers_json(&username);
                    (username, servers)
                })
        })
        .await;
    match storage_ok(result) {
        Some(Some((username, servers))) => {
            session.set_username(username.clone());
            session.send_json(
                PacketKind::ValidateSessionResponse,
                &ValidateSessionResponse {
                    valid: true,
                    u: Some(username),
                },
            );
            // A reconnecting client needs the server list to restore its UI;
            // without this replay every reconnect looks like a blank slate.
            session.send_packet(PacketKind::ServerListResponse, servers.as_bytes());
        }
        _ => {
            session.send_json(
                PacketKind::ValidateSessionResponse,
                &ValidateSessionResponse {
                    valid: false,
                    u: None,
                },
            );
        }
    }
    Ok(())
}

async fn handle_submit_2fa(
    ctx: &Arc<ServerCtx>,
    session: &Arc<Session>,
    conn: &mut ConnState,
    body: &[u8],
) -> anyhow::Result<()> {
    let req: Submit2faLoginRequest = parse_json(body)?;
    // The submit packet may carry the hardware id itself; that is the
    // reliable path when the TCP session was recreated between the login
    // attempt and the code entry.
    if !req.hwid.is_empty() {
        conn.pending_hwid = req.hwid.clone();
    }
    let hwid = conn.pending_hwid.clone();
    let result = ctx
        .storage
        .query(move |db| {
            db.verify_totp_login(&req.email, &req.code).map(|username| {
                db.trust_device(&username, &hwid);
                let servers = db.user_servers_json(&username);
                (username, servers)
            })
        })
        .await;
    match storage_ok(result) {
        Some(Some((username, servers))) => {
            if conn
                .pending_2fa_user
                .take()
                .is_some_and(|pending| pending != username)
            {
                debug!(
                    session = session.id,
                    "2FA completed for a different account than the pending attempt"
                );
            }
            session.set_username(username.clone());
            session.send_json(
                PacketKind::LoginSuccess,
                &LoginSuccess {
                    u: username,
                    two_fa_enabled: true,
                },
            );
            session.send_packet(PacketKind::ServerListResponse, servers.as_bytes());
        }
        _ => {
            session.send_packet(PacketKind::LoginFailed, b"");
        }
    }
    Ok(())
}

async fn handle_message_text(
    ctx: &Arc<ServerCtx>,
    session: &Arc<Session>,
    body: &[u8],
) -> anyhow::Result<()> {
    let req: MessageTextIn = parse_json(body)?;
    let user = current_user(session);
    let cid = req.cid;
    let reply_to = req.reply_to;
    let msg = req.msg;
    let attachment_id = req.attachment_id;

    let result = ctx
        .storage
        .query({
            let user = user.clone();
            let msg = msg.clone();
            let attachment_id = attachment_id.clone();
            move |db| {
                let mid = db.save_message(cid, &user, &msg, &attachment_id, reply_to);
                (mid, db.users_in_server_by_channel(cid))
            }
        })
        .await;
    if let Some((mid, members)) = storage_ok(result) {
        let frame = json_frame(
            PacketKind::MessageText,
            &MessageTextOut {
                mid,
                cid,
                u: user,
                msg,
                attachment_id,
                reply_to: (reply_to > 0).then_some(reply_to),
            },
        )?;
        broadcast(ctx, members, frame).await;
    }
    Ok(())
}

fn parse_json<'a, T: serde::Deserialize<'a>>(body: &'a [u8]) -> anyhow::Result<T> {
    serde_json::from_slice(body).context("invalid JSON body")
}

/// Only called past the auth gate, where a username is guaranteed.
fn current_user(session: &Arc<Session>) -> Username {
    session
        .username()
        .cloned()
        .unwrap_or_else(|| Username::from_full(""))
}

/// Collapse a storage-bridge failure into `None`, logging it once. Storage
/// trouble never kills the session and is never retried on this path.
fn storage_ok<R>(result: anyhow::Result<R>) -> Option<R> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("storage call failed: {e}");
            None
        }
    }
}

fn json_frame<T: serde::Serialize>(kind: PacketKind, body: &T) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(codec::encode_json(kind, body)?))
}

async fn broadcast(ctx: &Arc<ServerCtx>, members: Vec<Username>, frame: Bytes) {
    let members: HashSet<Username> = members.into_iter().collect();
    ctx.registry.broadcast_to_users(&members, frame).await;
}

/// Strip any path components and hostile characters from a client-supplied
/// filename, leaving something safe to join under the attachments dir.
fn sanitize_filename(raw: &str) -> String {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "file".into()
    } else {
        cleaned
    }
}
