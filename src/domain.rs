use std::fmt;
use std::str::FromStr;

use regex::Regex;
use std::sync::OnceLock;

/// A persisted link target: one chat/user pair currently bound to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatRecipient {
    pub chat_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Last,
    Final,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Last => "last",
            RelayMode::Final => "final",
        }
    }
}

impl FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last" | "" => Ok(RelayMode::Last),
            "final" => Ok(RelayMode::Final),
            other => Err(format!("RELAY_MODE must be last or final: got {other:?}")),
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotTransport {
    Polling,
    Webhook,
}

impl FromStr for BotTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" | "" => Ok(BotTransport::Polling),
            "webhook" => Ok(BotTransport::Webhook),
            other => Err(format!(
                "BOT_TRANSPORT must be polling or webhook: got {other:?}"
            )),
        }
    }
}

/// Where `/sessions` listings come from: the HTTP endpoint, the local CLI
/// binary, or a merge of both (endpoint entries win on id collision).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionsSource {
    Endpoint,
    Cli,
    Both,
}

impl FromStr for SessionsSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "endpoint" => Ok(SessionsSource::Endpoint),
            "cli" => Ok(SessionsSource::Cli),
            "both" | "" => Ok(SessionsSource::Both),
            other => Err(format!(
                "SESSIONS_SOURCE must be endpoint, cli or both: got {other:?}"
            )),
        }
    }
}

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^ses_[A-Za-z0-9]+$").expect("session id pattern"))
}

/// Strict whole-string match on the opaque session id format.
pub fn is_valid_session_id(value: &str) -> bool {
    session_id_pattern().is_match(value)
}
