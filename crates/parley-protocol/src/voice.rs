use crate::error::ProtocolError;
use crate::types::{ChannelId, Username};

/// Datagram tag bytes. The first byte of every datagram selects the path.
pub const UDP_TAG_VOICE: u8 = 0x00;
pub const UDP_TAG_HELLO: u8 = 0x01;
pub const UDP_TAG_PING: u8 = 0x02;
pub const UDP_TAG_PONG: u8 = 0x03;
pub const UDP_TAG_PROBE: u8 = 0xEE;

/// Link probes are fixed-size; anything else tagged 0xEE is dropped.
pub const PROBE_PACKET_SIZE: usize = 13;

/// Ping/pong carry an opaque 8-byte payload (sender timestamp).
pub const PING_PAYLOAD_SIZE: usize = 8;

/// Minimum voice payload: 4 (seq) + 1 (ulen) + 1 (name byte) + 1 (opus byte).
pub const VOICE_PAYLOAD_MIN: usize = 7;

/// Body of a `Voice_Data_Opus` packet and of a `0x00`-tagged datagram
/// (after the tag byte):
///
/// ```text
/// [seq: u32 BE] [ulen: u8] [username: ulen bytes] [opus: remainder]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePayload {
    pub seq: u32,
    pub sender: Username,
    pub opus: Vec<u8>,
}

impl VoicePayload {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < VOICE_PAYLOAD_MIN {
            return Err(ProtocolError::MalformedVoice(body.len()));
        }
        let seq = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let ulen = body[4] as usize;
        if ulen == 0 || body.len() < 5 + ulen + 1 {
            return Err(ProtocolError::MalformedVoice(body.len()));
        }
        let sender = std::str::from_utf8(&body[5..5 + ulen])
            .map_err(|_| ProtocolError::MalformedVoice(body.len()))?;
        Ok(Self {
            seq,
            sender: Username::from_full(sender),
            opus: body[5 + ulen..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let name = self.sender.as_str().as_bytes();
        debug_assert!(!name.is_empty() && name.len() <= u8::MAX as usize);
        let mut buf = Vec::with_capacity(5 + name.len() + self.opus.len());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
        buf.extend_from_slice(&self.opus);
        buf
    }
}

/// Wrap-aware sequence ordering: `a` is newer than `b` iff it lies in the
/// half-space ahead of `b` modulo 2^32.
pub fn seq_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

/// A `hello` datagram body (after the 0x01 tag): the client announces which
/// channel its endpoint should be bound into.
///
/// ```text
/// [ulen: u8] [username: ulen bytes] [channel: i32 BE]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHello {
    pub username: Username,
    pub channel: ChannelId,
}

impl UdpHello {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 1 + 1 + 4 {
            return Err(ProtocolError::MalformedHello(body.len()));
        }
        let ulen = body[0] as usize;
        if ulen == 0 || body.len() < 1 + ulen + 4 {
            return Err(ProtocolError::MalformedHello(body.len()));
        }
        let name = std::str::from_utf8(&body[1..1 + ulen])
            .map_err(|_| ProtocolError::MalformedHello(body.len()))?;
        let at = 1 + ulen;
        let cid = i32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);
        Ok(Self {
            username: Username::from_full(name),
            channel: ChannelId::from(cid),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let name = self.username.as_str().as_bytes();
        let mut buf = Vec::with_capacity(1 + name.len() + 4);
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
        buf.extend_from_slice(&(self.channel as i32).to_be_bytes());
        buf
    }
}

/// Downstream quality metrics, client to server. 13-byte body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReport {
    pub highest_seq: u32,
    pub packets_lost: u32,
    pub jitter_ms: u32,
    /// 0..=255 representing 0..=100%.
    pub fraction_lost: u8,
}

pub const RECEIVER_REPORT_SIZE: usize = 13;

impl ReceiverReport {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < RECEIVER_REPORT_SIZE {
            return Err(ProtocolError::TruncatedReport {
                expected: RECEIVER_REPORT_SIZE,
                got: body.len(),
            });
        }
        Ok(Self {
            highest_seq: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            packets_lost: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            jitter_ms: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
            fraction_lost: body[12],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECEIVER_REPORT_SIZE);
        buf.extend_from_slice(&self.highest_seq.to_be_bytes());
        buf.extend_from_slice(&self.packets_lost.to_be_bytes());
        buf.extend_from_slice(&self.jitter_ms.to_be_bytes());
        buf.push(self.fraction_lost);
        buf
    }

    /// Loss as a percentage (the wire carries 0..=255 for 0..=100%).
    pub fn loss_pct(&self) -> f32 {
        f32::from(self.fraction_lost) * 100.0 / 255.0
    }
}

/// Upstream verdict, server to sender. 12-byte body (3 reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub suggested_bitrate_kbps: u32,
    pub estimated_rtt_ms: u32,
    pub network_state: NetworkState,
}

pub const SENDER_REPORT_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkState {
    Stable = 0,
    Degraded = 1,
    Critical = 2,
}

impl SenderReport {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SENDER_REPORT_SIZE);
        buf.extend_from_slice(&self.suggested_bitrate_kbps.to_be_bytes());
        buf.extend_from_slice(&self.estimated_rtt_ms.to_be_bytes());
        buf.push(self.network_state as u8);
        buf.extend_from_slice(&[0u8; 3]);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < SENDER_REPORT_SIZE {
            return Err(ProtocolError::TruncatedReport {
                expected: SENDER_REPORT_SIZE,
                got: body.len(),
            });
        }
        let network_state = match body[8] {
            0 => NetworkState::Stable,
            1 => NetworkState::Degraded,
            _ => NetworkState::Critical,
        };
        Ok(Self {
            suggested_bitrate_kbps: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            estimated_rtt_ms: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            network_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_payload_roundtrip() {
        let original = VoicePayload {
            seq: 7,
            sender: Username::new("a", 1),
            opus: vec![0x11; 32],
        };
        let bytes = original.encode();
        let decoded = VoicePayload::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn voice_payload_single_opus_byte() {
        let original = VoicePayload {
            seq: u32::MAX,
            sender: Username::from_full("x"),
            opus: vec![0xFF],
        };
        let decoded = VoicePayload::decode(&original.encode()).unwrap();
        assert_eq!(decoded.seq, u32::MAX);
        assert_eq!(decoded.opus, vec![0xFF]);
    }

    #[test]
    fn voice_payload_too_short() {
        assert!(VoicePayload::decode(&[0, 0, 0, 1, 1, b'a']).is_err());
        assert!(VoicePayload::decode(&[]).is_err());
    }

    #[test]
    fn voice_payload_zero_ulen() {
        // seq + ulen=0 + two stray bytes: ulen must be > 0.
        assert!(VoicePayload::decode(&[0, 0, 0, 1, 0, 9, 9]).is_err());
    }

    #[test]
    fn voice_payload_ulen_overruns_body() {
        // ulen claims 10 name bytes but only 2 follow.
        assert!(VoicePayload::decode(&[0, 0, 0, 1, 10, b'a', b'b']).is_err());
    }

    #[test]
    fn voice_payload_no_opus_bytes() {
        // Name consumes the whole remainder: at least one opus byte required.
        assert!(VoicePayload::decode(&[0, 0, 0, 1, 2, b'a', b'b']).is_err());
    }

    #[test]
    fn seq_ordering_plain() {
        assert!(seq_newer(10, 9));
        assert!(!seq_newer(9, 10));
        assert!(!seq_newer(7, 7));
    }

    #[test]
    fn seq_ordering_wraps() {
        assert!(seq_newer(2, u32::MAX));
        assert!(!seq_newer(u32::MAX, 2));
        assert!(seq_newer(0, u32::MAX - 5));
    }

    #[test]
    fn hello_roundtrip() {
        let hello = UdpHello {
            username: Username::new("carol", 7),
            channel: 42,
        };
        let decoded = UdpHello::decode(&hello.encode()).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn hello_negative_channel() {
        let hello = UdpHello {
            username: Username::from_full("x"),
            channel: -1,
        };
        let decoded = UdpHello::decode(&hello.encode()).unwrap();
        assert_eq!(decoded.channel, -1);
    }

    #[test]
    fn hello_malformed() {
        assert!(UdpHello::decode(&[]).is_err());
        assert!(UdpHello::decode(&[0, 0, 0, 0, 42]).is_err()); // ulen == 0
        assert!(UdpHello::decode(&[3, b'a', b'b']).is_err()); // name overruns
    }

    #[test]
    fn receiver_report_roundtrip() {
        let report = ReceiverReport {
            highest_seq: 9000,
            packets_lost: 12,
            jitter_ms: 35,
            fraction_lost: 128,
        };
        let bytes = report.encode();
        assert_eq!(bytes.len(), RECEIVER_REPORT_SIZE);
        assert_eq!(ReceiverReport::decode(&bytes).unwrap(), report);
    }

    #[test]
    fn receiver_report_truncated() {
        assert!(matches!(
            ReceiverReport::decode(&[0; 12]),
            Err(ProtocolError::TruncatedReport { expected: 13, .. })
        ));
    }

    #[test]
    fn receiver_report_loss_pct_scale() {
        let full = ReceiverReport {
            highest_seq: 0,
            packets_lost: 0,
            jitter_ms: 0,
            fraction_lost: 255,
        };
        assert!((full.loss_pct() - 100.0).abs() < 0.01);
    }

    #[test]
    fn sender_report_roundtrip() {
        let report = SenderReport {
            suggested_bitrate_kbps: 24,
            estimated_rtt_ms: 80,
            network_state: NetworkState::Critical,
        };
        let bytes = report.encode();
        assert_eq!(bytes.len(), SENDER_REPORT_SIZE);
        let decoded = SenderReport::decode(&bytes).unwrap();
        assert_eq!(decoded, report);
        assert_eq!(bytes[8], 2);
        assert_eq!(&bytes[9..], &[0, 0, 0]);
    }
}
