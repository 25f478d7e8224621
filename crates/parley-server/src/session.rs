use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use parley_protocol::codec::{self, PacketKind};
use parley_protocol::types::{ChannelId, Username};

use crate::clock;

pub type SessionId = u64;

/// Sentinel stored in the `voice_channel` atomic when no channel is joined.
pub const NO_CHANNEL: ChannelId = -1;

/// Hard bound on the outbound queue. The drop policies below keep the
/// effective depth far lower; this is the channel's allocation size.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Control-plane packets tolerate a deep backlog before dropping.
pub const CONTROL_QUEUE_LIMIT: usize = 200;

/// Voice drop threshold scaled by the channel's voice load: a crowded
/// channel buys each receiver a shorter queue, bounding worst-case latency.
pub fn voice_drop_threshold(voice_load: usize) -> usize {
    if voice_load > 80 {
        12
    } else if voice_load > 30 {
        24
    } else if voice_load > 8 {
        32
    } else if voice_load > 4 {
        48
    } else {
        100
    }
}

/// One connected client. All outbound bytes for the socket funnel through
/// the bounded `outbound` queue and are written by a single writer task,
/// which serializes the socket without a per-session mutex.
pub struct Session {
    pub id: SessionId,
    pub peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    username: OnceLock<Username>,
    voice_channel: AtomicI64,
    healthy: AtomicBool,
    last_activity_ms: AtomicI64,
    voice_load: AtomicUsize,
    close_flag: AtomicBool,
    closed: Notify,
}

impl Session {
    pub fn new(id: SessionId, peer: SocketAddr) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Arc::new(Self {
            id,
            peer,
            outbound: tx,
            username: OnceLock::new(),
            voice_channel: AtomicI64::new(NO_CHANNEL),
            healthy: AtomicBool::new(true),
            last_activity_ms: AtomicI64::new(clock::now_ms()),
            voice_load: AtomicUsize::new(0),
            close_flag: AtomicBool::new(false),
            closed: Notify::new(),
        });
        (session, rx)
    }

    /// Empty until authenticated, then immutable.
    pub fn username(&self) -> Option<&Username> {
        self.username.get()
    }

    /// First authentication wins; a repeat attempt on an already
    /// authenticated session leaves the identity unchanged.
    pub fn set_username(&self, username: Username) {
        let _ = self.username.set(username);
    }

    pub fn voice_channel(&self) -> Option<ChannelId> {
        let cid = self.voice_channel.load(Ordering::Relaxed);
        (cid >= 0).then_some(cid)
    }

    /// Store the new channel and return the previous one.
    pub fn swap_voice_channel(&self, cid: Option<ChannelId>) -> Option<ChannelId> {
        let raw = cid.unwrap_or(NO_CHANNEL);
        let old = self.voice_channel.swap(raw, Ordering::Relaxed);
        (old >= 0).then_some(old)
    }

    pub fn clear_voice_channel(&self) {
        self.voice_channel.store(NO_CHANNEL, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    /// Stamped unconditionally on every received packet; drives the 300 s
    /// idle eviction. Distinct from the voice rate window.
    pub fn touch_activity(&self) {
        self.last_activity_ms
            .store(clock::now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Current member count of the session's voice channel, pushed by the
    /// registry on every membership refresh.
    pub fn set_voice_load(&self, load: usize) {
        self.voice_load.store(load, Ordering::Relaxed);
    }

    pub fn voice_load(&self) -> usize {
        self.voice_load.load(Ordering::Relaxed)
    }

    fn queue_depth(&self) -> usize {
        OUTBOUND_QUEUE_CAPACITY - self.outbound.capacity()
    }

    /// Enqueue a pre-encoded frame. Returns false when the frame was
    /// dropped (backlog over threshold or session gone). The writer task is
    /// the only consumer, so the in-flight front element is never touched.
    pub fn send(&self, frame: Bytes, is_voice: bool) -> bool {
        let depth = self.queue_depth();
        if is_voice {
            if depth >= voice_drop_threshold(self.voice_load()) {
                return false;
            }
        } else if depth > CONTROL_QUEUE_LIMIT {
            return false;
        }
        self.outbound.try_send(frame).is_ok()
    }

    pub fn send_packet(&self, kind: PacketKind, body: &[u8]) -> bool {
        self.send(Bytes::from(codec::encode(kind, body)), false)
    }

    pub fn send_json<T: Serialize>(&self, kind: PacketKind, body: &T) -> bool {
        match codec::encode_json(kind, body) {
            Ok(packet) => self.send(Bytes::from(packet), false),
            Err(e) => {
                debug!(session = self.id, "failed to encode {kind:?} body: {e}");
                false
            }
        }
    }

    /// Ask the connection driver to tear the session down. Idempotent;
    /// callable from the sweep, the writer, or the shutdown path.
    pub fn close(&self) {
        self.close_flag.store(true, Ordering::Release);
        self.closed.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.close_flag.load(Ordering::Acquire)
    }

    /// Resolves once `close` has been called.
    pub async fn wait_closed(&self) {
        if self.close_flag.load(Ordering::Acquire) {
            return;
        }
        self.closed.notified().await;
    }
}

/// Writer half of the session: drains the outbound queue in enqueue order.
/// A write failure marks the session unhealthy and requests teardown; the
/// liveness sweep or the reader loop finishes the job.
pub async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    session: Arc<Session>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(session = session.id, peer = %session.peer, "write error: {e}");
            session.mark_unhealthy();
            session.close();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session() -> (Arc<Session>, mpsc::Receiver<Bytes>) {
        Session::new(1, "127.0.0.1:9000".parse().unwrap())
    }

    #[test]
    fn username_set_once() {
        let (s, _rx) = make_session();
        assert!(s.username().is_none());
        s.set_username(Username::new("a", 1));
        s.set_username(Username::new("b", 2));
        assert_eq!(s.username().unwrap().as_str(), "a#0001");
    }

    #[test]
    fn voice_channel_sentinel() {
        let (s, _rx) = make_session();
        assert_eq!(s.voice_channel(), None);
        assert_eq!(s.swap_voice_channel(Some(42)), None);
        assert_eq!(s.voice_channel(), Some(42));
        assert_eq!(s.swap_voice_channel(None), Some(42));
        assert_eq!(s.voice_channel(), None);
    }

    #[test]
    fn voice_threshold_tiers() {
        assert_eq!(voice_drop_threshold(0), 100);
        assert_eq!(voice_drop_threshold(4), 100);
        assert_eq!(voice_drop_threshold(5), 48);
        assert_eq!(voice_drop_threshold(9), 32);
        assert_eq!(voice_drop_threshold(31), 24);
        assert_eq!(voice_drop_threshold(81), 12);
    }

    #[tokio::test]
    async fn control_packets_survive_deeper_backlog_than_voice() {
        let (s, mut rx) = make_session();
        s.set_voice_load(100); // voice threshold 12

        for _ in 0..12 {
            assert!(s.send(Bytes::from_static(b"v"), true));
        }
        // 13th voice frame is over threshold.
        assert!(!s.send(Bytes::from_static(b"v"), true));
        // Control still goes through.
        assert!(s.send(Bytes::from_static(b"c"), false));

        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, 13);
    }

    #[tokio::test]
    async fn control_limit_drops_past_200() {
        let (s, mut rx) = make_session();
        for _ in 0..201 {
            assert!(s.send(Bytes::from_static(b"c"), false));
        }
        // Depth now 201 > 200.
        assert!(!s.send(Bytes::from_static(b"c"), false));
        while rx.try_recv().is_ok() {}
        assert!(s.send(Bytes::from_static(b"c"), false));
    }

    #[tokio::test]
    async fn uncongested_voice_is_admitted() {
        let (s, mut rx) = make_session();
        for _ in 0..100 {
            assert!(s.send(Bytes::from_static(b"v"), true));
        }
        assert!(!s.send(Bytes::from_static(b"v"), true));
        let _ = rx.try_recv();
        assert!(s.send(Bytes::from_static(b"v"), true));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observable() {
        let (s, _rx) = make_session();
        assert!(!s.is_closed());
        s.close();
        s.close();
        assert!(s.is_closed());
        // Must resolve immediately after close.
        s.wait_closed().await;
    }

    #[test]
    fn send_packet_frames_header() {
        let (s, mut rx) = make_session();
        assert!(s.send_packet(PacketKind::EchoResponse, b"ping"));
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame[0], PacketKind::EchoResponse as u8);
        assert_eq!(&frame[5..], b"ping");
    }
}
