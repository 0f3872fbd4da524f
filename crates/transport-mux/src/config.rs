use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONTROL_LABEL: &str = "_vanguard";
pub const DEFAULT_CONTROL_ID: u16 = 0;
pub const DEFAULT_INBOX_DEPTH: usize = 10;
pub const DEFAULT_OFFER_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_CONTROL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings shared by negotiation runs and the peers they produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Label of the pre-negotiated control data channel.
    pub control_label: String,
    /// Stream id of the control data channel; both ends must agree on it.
    pub control_id: u16,
    /// Capacity of each virtual channel's inbox.
    pub inbox_depth: usize,
    /// How long an unhandled inbound offer stays open before it is closed.
    pub offer_grace: Duration,
    /// Upper bound on waiting for the control channel to open once connected.
    pub control_open_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            control_label: DEFAULT_CONTROL_LABEL.to_string(),
            control_id: DEFAULT_CONTROL_ID,
            inbox_depth: DEFAULT_INBOX_DEPTH,
            offer_grace: DEFAULT_OFFER_GRACE,
            control_open_timeout: DEFAULT_CONTROL_OPEN_TIMEOUT,
        }
    }
}

impl MuxConfig {
    /// Defaults overridden by `TRANSPORT_MUX_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let control_label = env::var("TRANSPORT_MUX_CONTROL_LABEL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.control_label);
        Self {
            control_label,
            control_id: env_parse("TRANSPORT_MUX_CONTROL_ID").unwrap_or(defaults.control_id),
            inbox_depth: env_parse("TRANSPORT_MUX_INBOX_DEPTH")
                .unwrap_or(defaults.inbox_depth)
                .max(1),
            offer_grace: env_parse("TRANSPORT_MUX_OFFER_GRACE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.offer_grace),
            control_open_timeout: env_parse("TRANSPORT_MUX_CONTROL_OPEN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.control_open_timeout),
        }
    }

    pub fn with_control_channel(mut self, label: impl Into<String>, id: u16) -> Self {
        self.control_label = label.into();
        self.control_id = id;
        self
    }

    pub fn with_inbox_depth(mut self, depth: usize) -> Self {
        self.inbox_depth = depth.max(1);
        self
    }

    pub fn with_offer_grace(mut self, grace: Duration) -> Self {
        self.offer_grace = grace;
        self
    }

    pub fn with_control_open_timeout(mut self, timeout: Duration) -> Self {
        self.control_open_timeout = timeout;
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}
