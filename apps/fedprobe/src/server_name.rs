use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::InputError;

pub const DEFAULT_FEDERATION_PORT: u16 = 8448;

/// Host portion of a server name. IP literals and hostnames are told apart
/// once, at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Host {
    Ip(IpAddr),
    Name(String),
}

impl Host {
    pub fn is_ip(&self) -> bool {
        matches!(self, Host::Ip(_))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip(ip) => write!(f, "{ip}"),
            Host::Name(name) => f.write_str(name),
        }
    }
}

/// A validated federation server name: `host[:port]`, where host is a DNS
/// name, an IPv4 literal or a bracketed IPv6 literal. Never carries a scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerName {
    raw: String,
    host: Host,
    port: Option<u16>,
}

impl ServerName {
    pub fn parse(input: &str) -> Result<Self, InputError> {
        if input.is_empty() {
            return Err(InputError::EmptyServerName);
        }
        if input.contains("://") {
            return Err(InputError::SchemePrefix(input.to_string()));
        }
        let malformed = |reason: &str| InputError::MalformedServerName {
            name: input.to_string(),
            reason: reason.to_string(),
        };
        if input.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(malformed("contains whitespace"));
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (literal, after) = rest
                .split_once(']')
                .ok_or_else(|| malformed("unterminated IPv6 literal"))?;
            let ip: Ipv6Addr = literal
                .parse()
                .map_err(|_| malformed("invalid IPv6 literal"))?;
            let port = match after {
                "" => None,
                other => Some(parse_port(
                    other
                        .strip_prefix(':')
                        .ok_or_else(|| malformed("unexpected text after IPv6 literal"))?,
                    &malformed,
                )?),
            };
            (Host::Ip(IpAddr::V6(ip)), port)
        } else if let Ok(ip) = input.parse::<Ipv6Addr>() {
            (Host::Ip(IpAddr::V6(ip)), None)
        } else {
            let (host, port) = match input.rsplit_once(':') {
                Some((host, port)) => (host, Some(parse_port(port, &malformed)?)),
                None => (input, None),
            };
            if host.is_empty() {
                return Err(malformed("missing host"));
            }
            match host.parse::<Ipv4Addr>() {
                Ok(ip) => (Host::Ip(IpAddr::V4(ip)), port),
                Err(_) => {
                    validate_hostname(host).map_err(|reason| malformed(reason))?;
                    (Host::Name(host.to_string()), port)
                }
            }
        };

        Ok(Self {
            raw: input.to_string(),
            host,
            port,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_ip_literal(&self) -> bool {
        self.host.is_ip()
    }
}

fn parse_port(text: &str, malformed: &dyn Fn(&str) -> InputError) -> Result<u16, InputError> {
    match text.parse::<u16>() {
        Ok(0) => Err(malformed("port must be between 1 and 65535")),
        Ok(port) => Ok(port),
        Err(_) => Err(malformed("port is not a number between 1 and 65535")),
    }
}

fn validate_hostname(host: &str) -> Result<(), &'static str> {
    if host.len() > 255 {
        return Err("hostname longer than 255 characters");
    }
    if host.starts_with('.') || host.ends_with('.') || host.contains("..") {
        return Err("empty hostname label");
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err("hostname may only contain letters, digits, '-' and '.'");
    }
    Ok(())
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ServerName {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ServerName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// The server part of a sigil-prefixed Matrix identifier (`@user:server`,
/// `!room:server`, `#alias:server`). Everything after the first colon,
/// including any port.
pub fn domain_of(identifier: &str) -> Option<&str> {
    let (_, domain) = identifier.split_once(':')?;
    (!domain.is_empty()).then_some(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hostname_without_port() {
        let name = ServerName::parse("example.org").unwrap();
        assert_eq!(name.host(), &Host::Name("example.org".into()));
        assert_eq!(name.port(), None);
        assert!(!name.is_ip_literal());
    }

    #[test]
    fn parses_hostname_with_port() {
        let name = ServerName::parse("matrix.example.org:8449").unwrap();
        assert_eq!(name.host(), &Host::Name("matrix.example.org".into()));
        assert_eq!(name.port(), Some(8449));
    }

    #[test]
    fn parses_ip_literals() {
        let v4 = ServerName::parse("1.2.3.4:99").unwrap();
        assert_eq!(v4.host(), &Host::Ip("1.2.3.4".parse().unwrap()));
        assert_eq!(v4.port(), Some(99));

        let v6 = ServerName::parse("[2001:db8::1]:8448").unwrap();
        assert_eq!(v6.host(), &Host::Ip("2001:db8::1".parse().unwrap()));
        assert_eq!(v6.port(), Some(8448));

        let bare = ServerName::parse("::1").unwrap();
        assert!(bare.is_ip_literal());
        assert_eq!(bare.port(), None);
    }

    #[test]
    fn rejects_scheme_prefix() {
        assert_eq!(
            ServerName::parse("https://example.org"),
            Err(InputError::SchemePrefix("https://example.org".into()))
        );
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "exa mple.org", "example.org:0", "example.org:99999", ":80", "[::1", "ex_ample.org", "a..b"] {
            assert!(ServerName::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn domain_of_keeps_port() {
        assert_eq!(domain_of("@alice:example.org:8448"), Some("example.org:8448"));
        assert_eq!(domain_of("!room:example.org"), Some("example.org"));
        assert_eq!(domain_of("@alice"), None);
        assert_eq!(domain_of("@alice:"), None);
    }
}
