use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;

pub const DEFAULT_PORT: u16 = 6379;

/// Host and port of the server. Both connections of a session use the same address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Address {
        Address {
            host: host.into(),
            port,
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses `host` or `host:port`.
impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in address {:?}", s))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(format!("missing host in address {:?}", s).into());
        }

        Ok(Address::new(host, port))
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub address: Address,
    /// Sent with `AUTH` after every connect when set.
    pub password: Option<String>,
    pub connect_timeout: Duration,
    /// How long a read waits for new bytes before giving up.
    pub read_timeout: Duration,
    /// Period of the liveness check that reconnects dropped connections.
    pub check_interval: Duration,
    /// Messages buffered per observer before a slow observer starts losing them.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: Address::default(),
            password: None,
            connect_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(1000),
            check_interval: Duration::from_millis(5000),
            event_capacity: 1024,
        }
    }
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Config {
        Config {
            address: Address::new(host, port),
            ..Config::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Config {
        self.password = Some(password.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Config {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Config {
        self.read_timeout = timeout;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Config {
        self.check_interval = interval;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Config {
        self.event_capacity = capacity.max(1);
        self
    }
}
