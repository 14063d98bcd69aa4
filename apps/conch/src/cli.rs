use crate::config::{CallConfig, ConfigError, parse_ice_servers};
use crate::telemetry::logging::{LogConfig, LogLevel};
use clap::{Args, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "conch",
    version,
    about = "Two-party audio/video calls negotiated over a websocket relay"
)]
pub struct Cli {
    #[arg(
        long,
        value_name = "URL",
        env = "CONCH_SIGNALING_URL",
        help = "Relay endpoint (ws, wss, http or https)"
    )]
    pub signaling_url: Option<String>,

    #[arg(
        long = "ice-server",
        value_name = "URL",
        help = "STUN/TURN server url; repeat for several. Replaces CONCH_ICE_SERVERS"
    )]
    pub ice_servers: Vec<String>,

    #[arg(long, help = "Gather host candidates only; no STUN/TURN")]
    pub localhost: bool,

    #[arg(long, help = "Capture audio only")]
    pub audio_only: bool,

    #[arg(long, help = "Place a call as soon as the relay connection is open")]
    pub call: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl Cli {
    /// Environment first, then the flags on top.
    pub fn call_config(&self) -> Result<CallConfig, ConfigError> {
        let mut config = CallConfig::from_env()?;
        if let Some(url) = &self.signaling_url {
            config = config.with_signaling_url(url)?;
        }
        if !self.ice_servers.is_empty() {
            config = config.with_ice_servers(parse_ice_servers(&self.ice_servers.join(",")));
        }
        if self.localhost {
            config = config.localhost();
        }
        if self.audio_only {
            config = config.with_video(None);
        }
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "CONCH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "CONCH_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

/// One line typed at the interactive prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Call,
    HangUp,
    Pause,
    Resume,
    Status,
    Help,
    Quit,
}

impl ConsoleCommand {
    pub const USAGE: &'static str = "commands: call, hangup, pause, resume, status, help, quit";

    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "call" | "c" => Some(ConsoleCommand::Call),
            "hangup" | "hang-up" | "h" => Some(ConsoleCommand::HangUp),
            "pause" | "p" => Some(ConsoleCommand::Pause),
            "resume" | "r" => Some(ConsoleCommand::Resume),
            "status" | "s" => Some(ConsoleCommand::Status),
            "help" | "?" => Some(ConsoleCommand::Help),
            "quit" | "exit" | "q" => Some(ConsoleCommand::Quit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_console_commands() {
        assert_eq!(ConsoleCommand::parse(" Call\n"), Some(ConsoleCommand::Call));
        assert_eq!(ConsoleCommand::parse("hangup"), Some(ConsoleCommand::HangUp));
        assert_eq!(ConsoleCommand::parse("q"), Some(ConsoleCommand::Quit));
        assert_eq!(ConsoleCommand::parse("dance"), None);
        assert_eq!(ConsoleCommand::parse(""), None);
    }

    #[test_timeout::timeout]
    fn parses_flags() {
        let cli = Cli::try_parse_from([
            "conch",
            "--signaling-url",
            "ws://127.0.0.1:9000",
            "--ice-server",
            "stun:a.example.org:3478",
            "--ice-server",
            "turn:b.example.org:3478",
            "--audio-only",
            "--call",
            "--log-level",
            "debug",
        ])
        .expect("parse");
        assert_eq!(cli.signaling_url.as_deref(), Some("ws://127.0.0.1:9000"));
        assert_eq!(cli.ice_servers.len(), 2);
        assert!(cli.audio_only);
        assert!(cli.call);
        assert_eq!(cli.logging.to_config().level, LogLevel::Debug);
    }

    #[test_timeout::timeout]
    fn rejects_unknown_log_level() {
        assert!(Cli::try_parse_from(["conch", "--log-level", "loud"]).is_err());
    }
}
