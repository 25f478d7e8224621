//! Datagram receive loop and the voice fan-out engine: one frame in, 0..N
//! replicas out, bounded effort per packet. Every failure here drops the
//! datagram; nothing may take the receive loop down.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use parley_protocol::codec::{self, PacketKind};
use parley_protocol::types::ChannelId;
use parley_protocol::voice::{
    UdpHello, VoicePayload, PING_PAYLOAD_SIZE, PROBE_PACKET_SIZE, UDP_TAG_HELLO, UDP_TAG_PING,
    UDP_TAG_PONG, UDP_TAG_PROBE, UDP_TAG_VOICE,
};

use crate::clock;
use crate::session::Session;
use crate::state::Registry;

/// Receive scratch size. Voice frames are far smaller; the headroom absorbs
/// anything a confused client throws at the port.
pub const MAX_UDP_PACKET_SIZE: usize = 65_535;

pub async fn run_udp_loop(socket: Arc<UdpSocket>, registry: Arc<Registry>) {
    let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(e) => {
                error!("UDP recv error: {e}");
                continue;
            }
        };
        if len == 0 {
            continue;
        }
        handle_datagram(&buf[..len], src, &socket, &registry).await;
    }
}

async fn handle_datagram(
    data: &[u8],
    src: SocketAddr,
    socket: &UdpSocket,
    registry: &Registry,
) {
    match data[0] {
        // Link probe: echoed back unchanged so the client can measure the
        // path before committing to the datagram transport.
        UDP_TAG_PROBE if data.len() == PROBE_PACKET_SIZE => {
            let _ = socket.send_to(data, src).await;
        }
        UDP_TAG_PING if data.len() >= 1 + PING_PAYLOAD_SIZE => {
            let mut pong = Vec::with_capacity(1 + PING_PAYLOAD_SIZE);
            pong.push(UDP_TAG_PONG);
            pong.extend_from_slice(&data[1..1 + PING_PAYLOAD_SIZE]);
            let _ = socket.send_to(&pong, src).await;
        }
        UDP_TAG_HELLO => handle_hello(&data[1..], src, registry).await,
        UDP_TAG_VOICE => handle_voice(&data[1..], src, socket, registry).await,
        tag => {
            trace!(target: "voice_trace", step = "udp_drop", reason = "unroutable", tag);
        }
    }
}

async fn handle_hello(body: &[u8], src: SocketAddr, registry: &Registry) {
    let hello = match UdpHello::decode(body) {
        Ok(hello) => hello,
        Err(e) => {
            trace!(target: "voice_trace", step = "udp_hello_drop", reason = "malformed", error = %e);
            return;
        }
    };
    match registry
        .bind_udp(&hello.username, hello.channel, src, clock::now_ms())
        .await
    {
        Ok(()) => {
            trace!(
                target: "voice_trace",
                step = "udp_hello_ok",
                user = %hello.username,
                cid = hello.channel,
            );
        }
        Err(reason) => {
            trace!(
                target: "voice_trace",
                step = "udp_hello_drop",
                reason,
                user = %hello.username,
            );
        }
    }
}

/// The targets of one fan-out. For any given frame each receiver appears in
/// exactly one of the two lists: the stream fallback is strictly the else
/// branch of the datagram path.
pub struct RoutePlan {
    pub cid: ChannelId,
    pub udp_targets: Vec<SocketAddr>,
    pub stream_targets: Vec<Arc<Session>>,
}

/// Validate the sender and build the target lists under the shared room
/// lock. The channel comes from the binding — never from a session scan.
pub async fn route_voice(
    registry: &Registry,
    payload: &VoicePayload,
    src: SocketAddr,
    now_ms: i64,
) -> Result<RoutePlan, &'static str> {
    let room = registry.room.read().await;

    let Some(binding) = room.udp_bindings.get(&payload.sender) else {
        return Err("sender_not_bound");
    };
    if binding.endpoint != src {
        return Err("endpoint_mismatch");
    }
    if !binding.admit(now_ms) {
        return Err("rate_limited");
    }

    let cid = binding.voice_channel;
    if cid < 0 {
        return Err("no_channel");
    }
    binding.record_seq(payload.seq);
    binding.touch(now_ms);

    if !registry.admit_speaker(cid, &payload.sender, now_ms) {
        return Err("speaker_cap_exceeded");
    }

    let mut plan = RoutePlan {
        cid,
        udp_targets: Vec::new(),
        stream_targets: Vec::new(),
    };
    if let Some(members) = room.voice_channels.get(&cid) {
        for member in members.values() {
            if member.username() == Some(&payload.sender) {
                continue;
            }
            let live_binding = member
                .username()
                .and_then(|u| room.udp_bindings.get(u))
                .filter(|b| b.voice_channel == cid && b.fresh(now_ms));
            match live_binding {
                Some(b) => plan.udp_targets.push(b.endpoint),
                None => plan.stream_targets.push(member.clone()),
            }
        }
    }
    Ok(plan)
}

async fn handle_voice(body: &[u8], src: SocketAddr, socket: &UdpSocket, registry: &Registry) {
    let payload = match VoicePayload::decode(body) {
        Ok(payload) => payload,
        Err(_) => {
            trace!(
                target: "voice_trace",
                step = "server_drop",
                reason = "parse_fail",
                size = body.len(),
            );
            return;
        }
    };

    let plan = match route_voice(registry, &payload, src, clock::now_ms()).await {
        Ok(plan) => plan,
        Err(reason) => {
            trace!(
                target: "voice_trace",
                step = "server_drop",
                reason,
                sender = %payload.sender,
            );
            return;
        }
    };

    trace!(
        target: "voice_trace",
        step = "server_relay",
        sender = %payload.sender,
        cid = plan.cid,
        udp = plan.udp_targets.len(),
        stream = plan.stream_targets.len(),
        bytes = body.len(),
    );

    // One shared buffer per path; the body is never copied per target.
    if !plan.stream_targets.is_empty() {
        let frame = Bytes::from(codec::encode(PacketKind::VoiceDataOpus, body));
        for session in &plan.stream_targets {
            session.send(frame.clone(), true);
        }
    }
    if !plan.udp_targets.is_empty() {
        let mut datagram = Vec::with_capacity(1 + body.len());
        datagram.push(UDP_TAG_VOICE);
        datagram.extend_from_slice(body);
        for endpoint in &plan.udp_targets {
            let _ = socket.send_to(&datagram, *endpoint).await;
        }
    }
}
