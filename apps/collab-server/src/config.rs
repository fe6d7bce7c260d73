use clap::Parser;
use collaboration::CollaborationConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Command line and environment configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "collab-server")]
#[command(about = "Real-time collaboration server for coding sessions")]
#[command(version)]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "COLLAB_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// tracing-subscriber filter directives
    #[arg(
        long = "log-filter",
        env = "COLLAB_LOG",
        default_value = "collab_server=debug,collaboration=debug"
    )]
    pub log_filter: String,

    /// Participant limit for sessions created without one
    #[arg(long, env = "COLLAB_MAX_PARTICIPANTS", default_value_t = 10)]
    pub max_participants: usize,

    /// Seconds without activity before a participant counts as idle
    #[arg(long, env = "COLLAB_IDLE_SECS", default_value_t = 60)]
    pub idle_secs: u64,

    /// Seconds without activity before a participant is marked disconnected
    #[arg(long, env = "COLLAB_DISCONNECT_SECS", default_value_t = 300)]
    pub disconnect_secs: u64,

    /// Interval of the idle sweep
    #[arg(long, env = "COLLAB_SWEEP_SECS", default_value_t = 30)]
    pub sweep_secs: u64,

    /// Base of generated invite links
    #[arg(long, env = "COLLAB_INVITE_BASE_URL", default_value = "http://localhost:3000")]
    pub invite_base_url: String,
}

impl ServerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs.max(1))
    }

    pub fn into_collaboration_config(self) -> CollaborationConfig {
        let defaults = CollaborationConfig::default();
        CollaborationConfig {
            idle_after: Duration::from_secs(self.idle_secs),
            disconnect_after: Duration::from_secs(self.disconnect_secs.max(self.idle_secs)),
            default_max_participants: self.max_participants.min(defaults.max_participants_limit),
            invite_base_url: self.invite_base_url,
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::try_parse_from(["collab-server"]).unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));

        let collab = config.into_collaboration_config();
        assert_eq!(collab.idle_after, Duration::from_secs(60));
        assert_eq!(collab.max_message_len, 4000);
    }

    #[test]
    fn test_flags_override() {
        let config = ServerConfig::try_parse_from([
            "collab-server",
            "--bind",
            "0.0.0.0:9001",
            "--max-participants",
            "4",
            "--idle-secs",
            "600",
            "--disconnect-secs",
            "120",
            "--invite-base-url",
            "https://codetracker.dev",
        ])
        .unwrap();
        assert_eq!(config.bind.port(), 9001);

        let collab = config.into_collaboration_config();
        assert_eq!(collab.default_max_participants, 4);
        assert_eq!(collab.disconnect_after, Duration::from_secs(600));
        assert_eq!(collab.invite_base_url, "https://codetracker.dev");
    }

    #[test]
    fn test_invalid_bind_rejected() {
        assert!(ServerConfig::try_parse_from(["collab-server", "--bind", "nowhere"]).is_err());
    }
}
