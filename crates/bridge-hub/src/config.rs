use crate::sessions::DEFAULT_SESSION_IDLE;
use bridge_core::wire::DEFAULT_MAX_FRAME_BYTES;
use clap::{builder::BoolishValueParser, ArgAction, Parser};
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8443";
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LOG_DIR: &str = ".bridge/logs";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub command_timeout: Duration,
    pub debug: bool,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_message_bytes: usize,
    pub session_idle: Duration,
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            debug: false,
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            max_message_bytes: DEFAULT_MAX_FRAME_BYTES,
            session_idle: DEFAULT_SESSION_IDLE,
            log_dir: DEFAULT_LOG_DIR.to_string(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "bridge-hub")]
pub struct Args {
    #[arg(long, env = "BRIDGE_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,
    #[arg(long, env = "BRIDGE_COMMAND_TIMEOUT_MS", default_value_t = DEFAULT_COMMAND_TIMEOUT_MS)]
    pub command_timeout_ms: u64,
    #[arg(
        long,
        env = "BRIDGE_DEBUG",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub debug: bool,
    /// Seconds between keepalive pings; 0 disables them.
    #[arg(long, default_value_t = 10)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,
    #[arg(long, env = "BRIDGE_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_message_bytes: usize,
    /// Seconds without a command before a caller session stops counting as active.
    #[arg(long, env = "BRIDGE_SESSION_IDLE_SECS", default_value_t = DEFAULT_SESSION_IDLE.as_secs())]
    pub session_idle_secs: u64,
    /// Empty disables the log file.
    #[arg(long, env = "BRIDGE_LOG_DIR", default_value = DEFAULT_LOG_DIR)]
    pub log_dir: String,
}

pub fn load_config() -> Config {
    Config::from(Args::parse())
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            addr: args.addr,
            command_timeout: Duration::from_millis(args.command_timeout_ms),
            debug: args.debug,
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout),
            queue_capacity: args.queue_capacity.max(1),
            max_message_bytes: args.max_message_bytes.max(1),
            session_idle: Duration::from_secs(args.session_idle_secs),
            log_dir: args.log_dir.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_take_precedence() {
        let args = Args::parse_from([
            "bridge-hub",
            "--addr",
            "127.0.0.1:9000",
            "--command-timeout-ms",
            "1500",
            "--log-dir",
            "/tmp/bridge-logs",
            "--queue-capacity",
            "0",
            "--max-message-bytes",
            "4096",
            "--debug",
        ]);
        let config = Config::from(args);
        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.command_timeout, Duration::from_millis(1_500));
        assert_eq!(config.log_dir, "/tmp/bridge-logs");
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.max_message_bytes, 4_096);
        assert!(config.debug);
    }

    #[test]
    fn interval_flags_are_seconds() {
        let args = Args::parse_from([
            "bridge-hub",
            "--ping-interval",
            "0",
            "--write-timeout",
            "5",
            "--session-idle-secs",
            "0",
        ]);
        let config = Config::from(args);
        assert!(config.ping_interval.is_zero());
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert!(config.session_idle.is_zero());
    }

    #[test]
    fn environment_fills_unset_flags() {
        std::env::set_var("BRIDGE_SESSION_IDLE_SECS", "42");
        let config = Config::from(Args::parse_from(["bridge-hub"]));
        std::env::remove_var("BRIDGE_SESSION_IDLE_SECS");
        assert_eq!(config.session_idle, Duration::from_secs(42));

        std::env::set_var("BRIDGE_SESSION_IDLE_SECS", "42");
        let config = Config::from(Args::parse_from(["bridge-hub", "--session-idle-secs", "7"]));
        std::env::remove_var("BRIDGE_SESSION_IDLE_SECS");
        assert_eq!(config.session_idle, Duration::from_secs(7));
    }
}
