use serde_json::json;
use std::time::Duration;
use tracing::info;

use crate::media::{MediaKind, RtpCodecCapability, WebRtcTransportOptions};

// ---------------------------------------------------------------------------
// Configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete signaling configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `SIGNALCAST_`.  Defaults are suitable for local development; production
/// deployments MUST override at least `announced_ip` so ICE candidates
/// carry a routable address.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP listener to.
    pub bind_addr: String,
    /// Local IP the media engine listens on for RTP.
    pub listen_ip: String,
    /// Public IP written into ICE candidates (None = use listen_ip).
    pub announced_ip: Option<String>,

    // ── Media engine ────────────────────────────────────────────────────
    /// Number of engine workers to provision.
    pub num_workers: usize,
    /// Minimum UDP/TCP port for engine transports.
    pub rtc_min_port: u16,
    /// Maximum UDP/TCP port for engine transports.
    pub rtc_max_port: u16,

    // ── Bandwidth ───────────────────────────────────────────────────────
    /// Per-transport cap on inbound bitrate (0 = uncapped).
    pub max_incoming_bitrate: u32,
    /// Initial outgoing bitrate estimate handed to new transports.
    pub initial_available_outgoing_bitrate: u32,

    // ── Protocol ────────────────────────────────────────────────────────
    /// Milliseconds a server-initiated request waits for its response.
    pub request_timeout_ms: u64,

    // ── Logging ──────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let bind_addr = env_or("SIGNALCAST_BIND_ADDR", "0.0.0.0:4443");
        let listen_ip = env_or("SIGNALCAST_LISTEN_IP", "0.0.0.0");
        let announced_ip = match std::env::var("SIGNALCAST_ANNOUNCED_IP") {
            Ok(v) if !v.is_empty() => Some(v),
            _ => Some("127.0.0.1".to_string()),
        };

        let num_workers = env_parse("SIGNALCAST_NUM_WORKERS", num_cpus());
        let rtc_min_port = env_parse("SIGNALCAST_RTC_MIN_PORT", 10_000u16);
        let rtc_max_port = env_parse("SIGNALCAST_RTC_MAX_PORT", 10_100u16);

        let max_incoming_bitrate =
            env_parse("SIGNALCAST_MAX_INCOMING_BITRATE", 1_500_000u32);
        let initial_available_outgoing_bitrate = env_parse(
            "SIGNALCAST_INITIAL_AVAILABLE_OUTGOING_BITRATE",
            1_000_000u32,
        );

        let request_timeout_ms = env_parse("SIGNALCAST_REQUEST_TIMEOUT_MS", 10_000u64);
        let log_level = env_or("SIGNALCAST_LOG_LEVEL", "info");

        let config = Config {
            bind_addr,
            listen_ip,
            announced_ip,
            num_workers,
            rtc_min_port,
            rtc_max_port,
            max_incoming_bitrate,
            initial_available_outgoing_bitrate,
            request_timeout_ms,
            log_level,
        };

        config.log_summary();
        config
    }

    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Codecs every room router is created with. Video only: VP8 with a
    /// raised start bitrate.
    pub fn media_codecs(&self) -> Vec<RtpCodecCapability> {
        vec![RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            parameters: json!({ "x-google-start-bitrate": 1000 }),
        }]
    }

    /// Options for one WebRTC transport. Both UDP and TCP are enabled;
    /// UDP is preferred unless the client asked to force TCP.
    pub fn transport_options(&self, force_tcp: bool) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.listen_ip.clone(),
            announced_ip: self.announced_ip.clone(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: !force_tcp,
            prefer_tcp: force_tcp,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }

    fn log_summary(&self) {
        info!("──── SignalCast Configuration ────");
        info!("  bind_addr          : {}", self.bind_addr);
        info!("  listen_ip          : {}", self.listen_ip);
        info!(
            "  announced_ip       : {}",
            self.announced_ip.as_deref().unwrap_or("(listen_ip)")
        );
        info!("  num_workers        : {}", self.num_workers);
        info!(
            "  rtc_port_range     : {}-{}",
            self.rtc_min_port, self.rtc_max_port
        );
        info!("  max_in_bitrate     : {}", self.max_incoming_bitrate);
        info!(
            "  init_out_bitrate   : {}",
            self.initial_available_outgoing_bitrate
        );
        info!("  request_timeout_ms : {}", self.request_timeout_ms);
        info!("  log_level          : {}", self.log_level);
        info!("──────────────────────────────────");
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4443".to_string(),
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: Some("127.0.0.1".to_string()),
            num_workers: 1,
            rtc_min_port: 10_000,
            rtc_max_port: 10_100,
            max_incoming_bitrate: 1_500_000,
            initial_available_outgoing_bitrate: 1_000_000,
            request_timeout_ms: 10_000,
            log_level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert!(config.rtc_min_port < config.rtc_max_port);
    }

    #[test]
    fn media_codecs_are_video_only() {
        let codecs = Config::default().media_codecs();
        assert_eq!(codecs.len(), 1);
        assert_eq!(codecs[0].kind, MediaKind::Video);
        assert_eq!(codecs[0].mime_type, "video/VP8");
        assert_eq!(codecs[0].clock_rate, 90_000);
    }

    #[test]
    fn transport_options_follow_force_tcp() {
        let config = Config::default();

        let udp = config.transport_options(false);
        assert!(udp.prefer_udp && !udp.prefer_tcp);
        assert!(udp.enable_udp && udp.enable_tcp);

        let tcp = config.transport_options(true);
        assert!(tcp.prefer_tcp && !tcp.prefer_udp);
    }
}
