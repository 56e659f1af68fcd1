//! Session configuration.
//!
//! [`SessionConfig`] is a `clap::Args` group: a host binary can flatten it
//! into its own command line, and every field also falls back to a
//! `CHAT_*` environment variable.

use std::time::Duration;

use clap::{Args, Parser};

use crate::{
    codec::DEFAULT_MAX_FRAME_LEN, error::ChatError, message::Hello, transport::ConnectionOptions,
};

#[derive(Args, Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Chat server host name or address.
    #[arg(long, env = "CHAT_HOST", default_value = "localhost")]
    pub host: String,

    /// Chat server port.
    #[arg(long, env = "CHAT_PORT", default_value_t = 16060)]
    pub port: u16,

    /// Milliseconds allowed for dialing and the initial handshake.
    #[arg(
        long = "connect-timeout-ms",
        env = "CHAT_CONNECT_TIMEOUT_MS",
        default_value = "5000",
        value_parser = parse_millis
    )]
    pub connect_timeout: Duration,

    /// Milliseconds a request may stay unanswered before it times out.
    #[arg(
        long = "request-timeout-ms",
        env = "CHAT_REQUEST_TIMEOUT_MS",
        default_value = "10000",
        value_parser = parse_millis
    )]
    pub request_timeout: Duration,

    /// First reconnect delay in milliseconds.
    #[arg(
        long = "initial-backoff-ms",
        env = "CHAT_INITIAL_BACKOFF_MS",
        default_value = "200",
        value_parser = parse_millis
    )]
    pub initial_reconnect_backoff: Duration,

    /// Upper bound on the reconnect delay in milliseconds.
    #[arg(
        long = "max-backoff-ms",
        env = "CHAT_MAX_BACKOFF_MS",
        default_value = "30000",
        value_parser = parse_millis
    )]
    pub max_reconnect_backoff: Duration,

    /// Close the connection after this many silent milliseconds. Off when unset.
    #[arg(long = "idle-timeout-ms", env = "CHAT_IDLE_TIMEOUT_MS", value_parser = parse_millis)]
    pub idle_timeout: Option<Duration>,

    /// Largest inbound frame accepted, in bytes.
    #[arg(long, env = "CHAT_MAX_FRAME_LEN", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    #[arg(long, env = "CHAT_USER_AGENT", default_value = "chat-session/0.1")]
    pub user_agent: String,

    /// Wire protocol version announced in the handshake.
    #[arg(long = "protocol-version", env = "CHAT_PROTOCOL_VERSION", default_value = "0.16.5")]
    pub protocol_version: String,

    #[arg(long, env = "CHAT_DEVICE_ID", default_value = "1")]
    pub device_id: String,

    #[arg(long, env = "CHAT_LANG", default_value = "en-US")]
    pub lang: String,

    /// One of android, ios, web.
    #[arg(long, env = "CHAT_PLATFORM", default_value = "web")]
    pub platform: String,
}

#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct Standalone {
    #[command(flatten)]
    config: SessionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 16060,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            initial_reconnect_backoff: Duration::from_millis(200),
            max_reconnect_backoff: Duration::from_secs(30),
            idle_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            user_agent: "chat-session/0.1".into(),
            protocol_version: "0.16.5".into(),
            device_id: "1".into(),
            lang: "en-US".into(),
            platform: "web".into(),
        }
    }
}

impl SessionConfig {
    /// Builds a config from `CHAT_*` environment variables and defaults.
    pub fn from_env() -> Result<Self, clap::Error> {
        Self::from_args(std::iter::empty::<String>())
    }

    /// Parses flags as if they were passed on a command line, without a
    /// program name.
    pub fn from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Standalone::try_parse_from(args).map(|parsed| parsed.config)
    }

    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.host.trim().is_empty() {
            return Err(ChatError::InvalidArgument("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ChatError::InvalidArgument("port must not be 0".into()));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(ChatError::InvalidArgument(
                "timeouts must be greater than zero".into(),
            ));
        }
        if self.initial_reconnect_backoff.is_zero() {
            return Err(ChatError::InvalidArgument(
                "initial_reconnect_backoff must be greater than zero".into(),
            ));
        }
        if self.max_reconnect_backoff < self.initial_reconnect_backoff {
            return Err(ChatError::InvalidArgument(
                "max_reconnect_backoff must not be below initial_reconnect_backoff".into(),
            ));
        }
        if self.max_frame_len == 0 {
            return Err(ChatError::InvalidArgument("max_frame_len must not be 0".into()));
        }
        Ok(())
    }

    pub(crate) fn hello(&self) -> Hello {
        Hello {
            tag: None,
            user_agent: self.user_agent.clone(),
            ver: self.protocol_version.clone(),
            device_id: self.device_id.clone(),
            lang: self.lang.clone(),
            platform: self.platform.clone(),
        }
    }

    pub(crate) fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_frame_len: self.max_frame_len,
            idle_timeout: self.idle_timeout,
        }
    }
}

fn parse_millis(value: &str) -> Result<Duration, String> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|error| format!("expected milliseconds, got '{value}': {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let config = SessionConfig::from_args([
            "--host",
            "chat.internal",
            "--port",
            "7000",
            "--request-timeout-ms",
            "250",
            "--idle-timeout-ms",
            "45000",
        ])
        .expect("parse");

        assert_eq!(config.addr(), "chat.internal:7000");
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.max_reconnect_backoff, Duration::from_secs(30));
    }

    #[test]
    fn malformed_duration_is_rejected() {
        assert!(SessionConfig::from_args(["--connect-timeout-ms", "soon"]).is_err());
    }

    #[test]
    fn validation_catches_unusable_values() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(matches!(
            SessionConfig::default().with_server("", 7000).validate(),
            Err(ChatError::InvalidArgument(_))
        ));
        assert!(SessionConfig::default()
            .with_server("localhost", 0)
            .validate()
            .is_err());
    }

    #[test]
    fn zero_reconnect_backoff_is_rejected() {
        let config = SessionConfig {
            initial_reconnect_backoff: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChatError::InvalidArgument(_))));

        let inverted = SessionConfig {
            initial_reconnect_backoff: Duration::from_secs(5),
            max_reconnect_backoff: Duration::from_secs(1),
            ..SessionConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn hello_carries_client_identification() {
        let hello = SessionConfig::default().hello();
        assert_eq!(hello.ver, "0.16.5");
        assert_eq!(hello.platform, "web");
        assert!(hello.tag.is_none());
    }
}
