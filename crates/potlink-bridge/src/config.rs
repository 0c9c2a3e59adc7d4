use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};

/// Default `MQTT` broker port.
pub const DEFAULT_PORT: u16 = 1883;

/// Environment variable holding the broker `URL`.
pub const BROKER_URL_VAR: &str = "MQTT_BROKER_URL";
/// Environment variable holding the `MQTT` client identifier.
pub const CLIENT_ID_VAR: &str = "MQTT_CLIENT_ID";
/// Environment variable holding the default call timeout, in seconds.
pub const CALL_TIMEOUT_VAR: &str = "POTLINK_CALL_TIMEOUT_SECS";
/// Environment variable holding the maximum number of in-flight calls.
pub const MAX_IN_FLIGHT_VAR: &str = "POTLINK_MAX_IN_FLIGHT";

const SCHEMES: &[&str] = &["mqtt://", "tcp://"];

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_CLIENT_ID: &str = "backend";

// Keep alive time to send `pingreq` to broker when the connection is idle.
const KEEP_ALIVE_TIME: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_IN_FLIGHT: usize = 64;
// The capacity of the bounded asynchronous channels.
const CHANNEL_CAPACITY: usize = 64;

fn config_error(description: impl Into<std::borrow::Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Config, description)
}

/// Broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Broker host name or address.
    pub host: String,
    /// Broker port number.
    pub port: u16,
}

impl BrokerAddress {
    /// Creates a [`BrokerAddress`].
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses a [`BrokerAddress`] from an `URL` such as
    /// `mqtt://broker.local:1883`.
    ///
    /// The scheme is optional, and the port defaults to [`DEFAULT_PORT`].
    ///
    /// # Errors
    ///
    /// An error is returned when the scheme is not `mqtt` nor `tcp`, when the
    /// host is empty, or when the port is not a valid number.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let authority = match SCHEMES.iter().find_map(|scheme| url.strip_prefix(scheme)) {
            Some(authority) => authority,
            None if url.contains("://") => {
                return Err(config_error(format!(
                    "Unsupported scheme in broker URL `{url}`, expected `mqtt://`"
                )));
            }
            None => url,
        };
        let authority = authority.trim_end_matches('/');

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| config_error(format!("Invalid port in `{url}`: {e}")))?;
                (host, port)
            }
            None => (authority, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(config_error(format!("Missing host in broker URL `{url}`")));
        }

        Ok(Self::new(host, port))
    }
}

impl Default for BrokerAddress {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mqtt://{}:{}", self.host, self.port)
    }
}

/// Exponential backoff applied between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 10)
    }
}

impl Backoff {
    /// Creates a [`Backoff`].
    ///
    /// The delay starts at `initial`, doubles on each consecutive failure up
    /// to `max`, and the connection is abandoned after `max_attempts`
    /// consecutive failures.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
        }
    }

    /// Returns the delay before the given attempt, starting from `1`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial.saturating_mul(1 << exponent).min(self.max)
    }

    /// Returns the maximum number of consecutive failed attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// What the ledger does with a call once it leaves the pending state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LedgerRetention {
    /// Keep every settled call for auditing.
    #[default]
    KeepSettled,
    /// Delete delivered calls, keeping only failed ones.
    DropDelivered,
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub(crate) broker: BrokerAddress,
    pub(crate) client_id: String,
    pub(crate) keep_alive: Duration,
    pub(crate) call_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) max_in_flight: usize,
    pub(crate) channel_capacity: usize,
    pub(crate) reconnect: Backoff,
    pub(crate) retention: LedgerRetention,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(BrokerAddress::default())
    }
}

impl BridgeConfig {
    /// Creates a [`BridgeConfig`] for the given broker, with default values
    /// for all other settings.
    #[must_use]
    pub fn new(broker: BrokerAddress) -> Self {
        Self {
            broker,
            client_id: DEFAULT_CLIENT_ID.into(),
            keep_alive: KEEP_ALIVE_TIME,
            call_timeout: CALL_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            max_in_flight: MAX_IN_FLIGHT,
            channel_capacity: CHANNEL_CAPACITY,
            reconnect: Backoff::default(),
            retention: LedgerRetention::default(),
        }
    }

    /// Reads a [`BridgeConfig`] from the process environment.
    ///
    /// # Errors
    ///
    /// An error is returned when a variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads a [`BridgeConfig`] through a lookup function mapping variable
    /// names to their values.
    ///
    /// Missing variables keep their default values.
    ///
    /// # Errors
    ///
    /// An error is returned when a variable holds an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker = match lookup(BROKER_URL_VAR) {
            Some(url) => BrokerAddress::parse(&url)?,
            None => BrokerAddress::default(),
        };

        let mut config = Self::new(broker);

        if let Some(client_id) = lookup(CLIENT_ID_VAR) {
            config.client_id = client_id;
        }

        if let Some(secs) = lookup(CALL_TIMEOUT_VAR) {
            let secs = secs
                .trim()
                .parse::<u64>()
                .map_err(|e| config_error(format!("Invalid `{CALL_TIMEOUT_VAR}`: {e}")))?;
            config.call_timeout = Duration::from_secs(secs);
        }

        if let Some(max) = lookup(MAX_IN_FLIGHT_VAR) {
            config.max_in_flight = max
                .trim()
                .parse::<usize>()
                .map_err(|e| config_error(format!("Invalid `{MAX_IN_FLIGHT_VAR}`: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the `MQTT` client identifier.
    #[must_use]
    #[inline]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Sets the keep alive interval.
    #[must_use]
    #[inline]
    pub const fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the default call timeout.
    #[must_use]
    #[inline]
    pub const fn call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Sets how long to wait for the broker to accept the first connection.
    #[must_use]
    #[inline]
    pub const fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Sets the maximum number of concurrent in-flight calls.
    ///
    /// Calls beyond this limit wait for a free slot within their own
    /// deadline.
    #[must_use]
    #[inline]
    pub const fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Sets the capacity of the internal message channels.
    #[must_use]
    #[inline]
    pub const fn channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity;
        self
    }

    /// Sets the reconnection [`Backoff`].
    #[must_use]
    #[inline]
    pub const fn reconnect(mut self, reconnect: Backoff) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the [`LedgerRetention`] policy.
    #[must_use]
    #[inline]
    pub const fn retention(mut self, retention: LedgerRetention) -> Self {
        self.retention = retention;
        self
    }

    /// Returns the broker address.
    #[must_use]
    pub const fn broker(&self) -> &BrokerAddress {
        &self.broker
    }

    /// Returns the default call timeout.
    #[must_use]
    pub const fn default_call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Checks the configuration consistency.
    ///
    /// # Errors
    ///
    /// An error is returned for an empty client identifier, a zero timeout
    /// or a zero capacity.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(config_error("The MQTT client identifier must not be empty"));
        }
        if self.call_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(config_error("Timeouts must be greater than zero"));
        }
        if self.max_in_flight == 0 || self.channel_capacity == 0 {
            return Err(config_error("Capacities must be greater than zero"));
        }
        Ok(())
    }
}
