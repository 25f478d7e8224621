//! JSON bodies of the control-plane packets. Inbound structs use
//! `#[serde(default)]` for fields older clients omit; outbound structs skip
//! `None` fields so the wire stays compact.

use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, MessageId, ServerId, Username};

// --- Auth -----------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub e: String,
    pub u: String,
    pub p: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterSuccess {
    pub u: Username,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub e: String,
    pub p: String,
    #[serde(default)]
    pub hwid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginSuccess {
    pub u: Username,
    #[serde(rename = "2fa_enabled")]
    pub two_fa_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequires2fa {
    pub u: Username,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateSessionRequest {
    pub e: String,
    pub ph: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateSessionResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub u: Option<Username>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Submit2faLoginRequest {
    pub email: String,
    pub code: String,
    #[serde(default)]
    pub hwid: String,
}

// --- Servers and channels -------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinServerRequest {
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetServerContentRequest {
    pub sid: ServerId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateChannelRequest {
    pub sid: ServerId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectTextChannel {
    pub cid: ChannelId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinVoiceChannel {
    /// `-1` leaves the current voice channel.
    pub cid: ChannelId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteChannelRequest {
    pub cid: ChannelId,
    pub sid: ServerId,
}

// --- Messages -------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MessageTextIn {
    pub cid: ChannelId,
    pub msg: String,
    #[serde(default)]
    pub attachment_id: String,
    #[serde(default)]
    pub reply_to: MessageId,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageTextOut {
    pub mid: MessageId,
    pub cid: ChannelId,
    pub u: Username,
    pub msg: String,
    pub attachment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteMessageRequest {
    pub mid: MessageId,
    pub cid: ChannelId,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageDeleted {
    pub mid: MessageId,
    pub cid: ChannelId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditMessageRequest {
    pub mid: MessageId,
    pub cid: ChannelId,
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PinMessageRequest {
    pub mid: MessageId,
    pub cid: ChannelId,
    pub pin: bool,
}

// --- Membership -----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MemberListRequest {
    pub sid: ServerId,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberEntry {
    pub u: Username,
    pub online: bool,
}

// --- Attachments ----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FileTransferRequest {
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileTransferReply<'a> {
    pub action: &'a str,
    pub id: String,
}

// --- Voice control --------------------------------------------------------

/// Membership notification. A joiner receives the full `members` list; other
/// members receive a `{u, action}` delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub cid: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<Username>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<Username>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceMuteStateIn {
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceMuteStateOut {
    pub u: Username,
    pub muted: bool,
    pub deafened: bool,
    pub cid: ChannelId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStatsReport {
    #[serde(default = "no_channel")]
    pub cid: ChannelId,
    #[serde(default)]
    pub ping_ms: f32,
    #[serde(default)]
    pub loss_pct: f32,
    #[serde(default)]
    pub jitter_ms: f32,
    #[serde(default)]
    pub buffer_ms: i32,
}

fn no_channel() -> ChannelId {
    -1
}

/// Per-channel tuning pushed to every member on each membership change.
/// All values scale with the member count `n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub keepalive_interval_ms: i64,
    pub voice_state_request_interval_sec: i64,
    pub jitter_buffer_target_ms: i64,
    pub jitter_buffer_min_ms: i64,
    pub jitter_buffer_max_ms: i64,
    pub codec_target_kbps: i64,
    pub prefer_udp: bool,
}

impl VoiceConfig {
    /// Mathematical profile rather than hardcoded tiers: jitter headroom
    /// grows with the crowd, codec budget shrinks, floor at 24 kbps.
    pub fn scaled(member_count: usize) -> Self {
        let n = member_count as i64;
        Self {
            keepalive_interval_ms: (2000 + n * 100).clamp(2000, 6000),
            voice_state_request_interval_sec: (3 + n / 5).clamp(3, 6),
            jitter_buffer_target_ms: (50 + n * 5).clamp(50, 200),
            jitter_buffer_min_ms: (30 + n * 2).clamp(30, 100),
            jitter_buffer_max_ms: (120 + n * 10).clamp(120, 400),
            codec_target_kbps: (64 - n * 2).max(24),
            prefer_udp: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_config_single_member() {
        let cfg = VoiceConfig::scaled(1);
        assert_eq!(cfg.jitter_buffer_target_ms, 55);
        assert_eq!(cfg.jitter_buffer_min_ms, 32);
        assert_eq!(cfg.jitter_buffer_max_ms, 130);
        assert_eq!(cfg.codec_target_kbps, 62);
        assert_eq!(cfg.keepalive_interval_ms, 2100);
        assert!(cfg.prefer_udp);
    }

    #[test]
    fn voice_config_clamps_large_channels() {
        let cfg = VoiceConfig::scaled(100);
        assert_eq!(cfg.jitter_buffer_target_ms, 200);
        assert_eq!(cfg.jitter_buffer_min_ms, 100);
        assert_eq!(cfg.jitter_buffer_max_ms, 400);
        assert_eq!(cfg.codec_target_kbps, 24);
        assert_eq!(cfg.keepalive_interval_ms, 6000);
        assert_eq!(cfg.voice_state_request_interval_sec, 6);
    }

    #[test]
    fn voice_config_empty_channel_floors() {
        let cfg = VoiceConfig::scaled(0);
        assert_eq!(cfg.jitter_buffer_target_ms, 50);
        assert_eq!(cfg.jitter_buffer_min_ms, 30);
        assert_eq!(cfg.codec_target_kbps, 64);
    }

    #[test]
    fn login_success_renames_2fa_field() {
        let body = LoginSuccess {
            u: Username::new("a", 1),
            two_fa_enabled: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["2fa_enabled"], false);
        assert_eq!(json["u"], "a#0001");
    }

    #[test]
    fn message_text_optional_fields_default() {
        let body: MessageTextIn = serde_json::from_str(r#"{"cid": 3, "msg": "hi"}"#).unwrap();
        assert_eq!(body.cid, 3);
        assert!(body.attachment_id.is_empty());
        assert_eq!(body.reply_to, 0);
    }

    #[test]
    fn voice_state_update_delta_shape() {
        let delta = VoiceStateUpdate {
            cid: 42,
            members: None,
            u: Some(Username::new("a", 1)),
            action: Some("join".into()),
        };
        let json = serde_json::to_value(&delta).unwrap();
        assert!(json.get("members").is_none());
        assert_eq!(json["action"], "join");

        let full = VoiceStateUpdate {
            cid: 42,
            members: Some(vec![Username::new("a", 1)]),
            u: None,
            action: None,
        };
        let json = serde_json::to_value(&full).unwrap();
        assert_eq!(json["members"][0], "a#0001");
        assert!(json.get("action").is_none());
    }

    #[test]
    fn create_channel_type_keyword() {
        let body: CreateChannelRequest =
            serde_json::from_str(r#"{"sid": 1, "name": "general", "type": "voice"}"#).unwrap();
        assert_eq!(body.kind, "voice");
    }
}
