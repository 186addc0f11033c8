use core::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq)]
pub enum BadLocalAddr {
    Empty,
    HostMissing,
    TooManyColons,
    BadPort { value: String },
}

impl fmt::Display for BadLocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadLocalAddr::Empty => write!(f, "address is empty"),
            BadLocalAddr::HostMissing => write!(f, "host is missing"),
            BadLocalAddr::TooManyColons => write!(f, "too many colons in address"),
            BadLocalAddr::BadPort { value } => write!(f, "bad port value: {value}"),
        }
    }
}

impl std::error::Error for BadLocalAddr {}

/// `<HOST>[:<PORT>]` as advertised by the tunnel creator.
///
/// The port is optional; when absent, command generation defaults it to 443.
/// The original textual form is preserved because it is echoed back verbatim
/// in the suggested `ssh` command and used as the upstream `Host` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddr {
    serialization: String,
    host_end: usize,
    port: Option<u16>,
}

impl LocalAddr {
    const DEFAULT_PORT: u16 = 443;

    pub fn parse(s: &str) -> Result<Self, BadLocalAddr> {
        if s.is_empty() {
            return Err(BadLocalAddr::Empty);
        }

        let (host_end, port) = if let Some(colon) = s.rfind(':') {
            let port = &s[colon + 1..];
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|p| *p >= 1)
                .ok_or_else(|| BadLocalAddr::BadPort { value: port.to_owned() })?;
            (colon, Some(port))
        } else {
            (s.len(), None)
        };

        if host_end == 0 {
            return Err(BadLocalAddr::HostMissing);
        }

        let host = &s[..host_end];
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(BadLocalAddr::TooManyColons);
        }

        Ok(LocalAddr {
            serialization: s.to_owned(),
            host_end,
            port,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.serialization
    }

    pub fn host(&self) -> &str {
        &self.serialization[..self.host_end]
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The address as it appears in the `-R` clause of the suggested command,
    /// with `:443` appended when the creator didn't name a port.
    pub fn command_form(&self) -> String {
        match self.port {
            Some(_) => self.serialization.clone(),
            None => format!("{}:{}", self.serialization, Self::DEFAULT_PORT),
        }
    }
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialization)
    }
}

impl FromStr for LocalAddr {
    type Err = BadLocalAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LocalAddr::parse(s)
    }
}

/// Parses a listen-address flag value, accepting the `:PORT` shorthand for
/// all-interfaces binds.
pub fn parse_listen_addr(s: &str) -> Result<SocketAddr, BadLocalAddr> {
    let full = if s.starts_with(':') {
        format!("0.0.0.0{s}")
    } else {
        s.to_owned()
    };

    full.parse::<SocketAddr>().map_err(|_| BadLocalAddr::BadPort {
        value: s.to_owned(),
    })
}
