use serde::Deserialize;

/// Server configuration, loaded from a TOML file. CLI flags override.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind both sockets on.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port: control plane and stream-fallback voice.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// UDP port: voice datagrams and link probes.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Maximum concurrent sessions; connections beyond this are refused.
    #[serde(default = "default_max_users")]
    pub max_users: usize,

    /// Directory for finished and in-progress attachment uploads.
    #[serde(default = "default_attachments_dir")]
    pub attachments_dir: String,

    /// Path of the rolling voice-telemetry snapshot.
    #[serde(default = "default_stats_path")]
    pub stats_path: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_tcp_port() -> u16 {
    5555
}

fn default_udp_port() -> u16 {
    5556
}

fn default_max_users() -> usize {
    256
}

fn default_attachments_dir() -> String {
    "attachments".into()
}

fn default_stats_path() -> String {
    "voice_stats.json".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            max_users: default_max_users(),
            attachments_dir: default_attachments_dir(),
            stats_path: default_stats_path(),
        }
    }
}
