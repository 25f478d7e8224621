use serde::Serialize;

use crate::error::ProtocolError;

/// Size of the packet header on the wire: type byte + big-endian body length.
pub const HEADER_SIZE: usize = 5;

/// Maximum accepted body size: 10 MiB. A header declaring more is a
/// protocol violation and tears the session down.
pub const MAX_BODY_SIZE: u32 = 10 * 1024 * 1024;

/// Every packet type the server speaks. The discriminant is the wire byte;
/// an unknown byte closes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    // --- Auth ---
    RegisterRequest = 0,
    RegisterSuccess = 1,
    RegisterFailed = 2,
    LoginRequest = 3,
    LoginSuccess = 4,
    LoginFailed = 5,
    LoginRequires2fa = 6,
    ValidateSessionRequest = 7,
    ValidateSessionResponse = 8,
    Submit2faLoginRequest = 9,

    // --- Servers and channels ---
    CreateServerRequest = 10,
    JoinServerRequest = 11,
    ServerListResponse = 12,
    GetServerContentRequest = 13,
    ServerContentResponse = 14,
    CreateChannelRequest = 15,
    SelectTextChannel = 16,
    JoinVoiceChannel = 17,

    // --- Messages ---
    MessageText = 18,
    MessageEdit = 19,
    MessageDelete = 20,
    MessageHistoryResponse = 21,

    // --- Attachments ---
    FileTransferRequest = 22,
    FileTransferChunk = 23,
    FileTransferComplete = 24,

    // --- Voice ---
    VoiceData = 25, // legacy PCM framing; relayed but no longer produced
    VoiceDataOpus = 26,
    VoiceStateUpdate = 27,
    VoiceConfig = 28,
    VoiceStatsReport = 29,

    // --- RTCP-lite telemetry ---
    ReceiverReport = 30,
    SenderReport = 31,

    // --- Deletion / edit ---
    DeleteChannelRequest = 32,
    DeleteMessageRequest = 33,
    EditMessageRequest = 34,
    PinMessageRequest = 35,

    // --- Membership / presence ---
    MemberListRequest = 36,
    MemberListResponse = 37,
    VoiceMuteState = 38,

    // --- Diagnostic ---
    EchoRequest = 39,
    EchoResponse = 40,
}

impl PacketKind {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        use PacketKind::*;
        Ok(match b {
            0 => RegisterRequest,
            1 => RegisterSuccess,
            2 => RegisterFailed,
            3 => LoginRequest,
            4 => LoginSuccess,
            5 => LoginFailed,
            6 => LoginRequires2fa,
            7 => ValidateSessionRequest,
            8 => ValidateSessionResponse,
            9 => Submit2faLoginRequest,
            10 => CreateServerRequest,
            11 => JoinServerRequest,
            12 => ServerListResponse,
            13 => GetServerContentRequest,
            14 => ServerContentResponse,
            15 => CreateChannelRequest,
            16 => SelectTextChannel,
            17 => JoinVoiceChannel,
            18 => MessageText,
            19 => MessageEdit,
            20 => MessageDelete,
            21 => MessageHistoryResponse,
            22 => FileTransferRequest,
            23 => FileTransferChunk,
            24 => FileTransferComplete,
            25 => VoiceData,
            26 => VoiceDataOpus,
            27 => VoiceStateUpdate,
            28 => VoiceConfig,
            29 => VoiceStatsReport,
            30 => ReceiverReport,
            31 => SenderReport,
            32 => DeleteChannelRequest,
            33 => DeleteMessageRequest,
            34 => EditMessageRequest,
            35 => PinMessageRequest,
            36 => MemberListRequest,
            37 => MemberListResponse,
            38 => VoiceMuteState,
            39 => EchoRequest,
            40 => EchoResponse,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }

    /// Kinds whose body is raw bytes rather than UTF-8 JSON.
    pub fn is_raw_body(self) -> bool {
        use PacketKind::*;
        matches!(
            self,
            FileTransferChunk
                | VoiceData
                | VoiceDataOpus
                | ReceiverReport
                | SenderReport
                | EchoRequest
                | EchoResponse
        )
    }

    /// Kinds a session may send before it has authenticated.
    pub fn is_auth_exempt(self) -> bool {
        use PacketKind::*;
        matches!(
            self,
            RegisterRequest | LoginRequest | ValidateSessionRequest | Submit2faLoginRequest
        )
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: PacketKind,
    pub size: u32,
}

/// Decode the 5-byte header. `size` is validated against [`MAX_BODY_SIZE`].
pub fn decode_header(bytes: &[u8]) -> Result<Header, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::TruncatedHeader(bytes.len()));
    }
    let kind = PacketKind::from_byte(bytes[0])?;
    let size = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    if size > MAX_BODY_SIZE {
        return Err(ProtocolError::OversizeDeclared(size));
    }
    Ok(Header { kind, size })
}

/// Build a complete wire packet: 5-byte header followed by the body.
pub fn encode(kind: PacketKind, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.push(kind as u8);
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Build a wire packet with a JSON body.
pub fn encode_json<T: Serialize>(kind: PacketKind, body: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(body)?;
    Ok(encode(kind, &payload))
}
