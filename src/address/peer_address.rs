use crate::error::Error;
use std::convert::TryFrom;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/**
 * Remote or local endpoint of a link: a host and a port. The host is either an
 * IP literal or a name to be resolved. The canonical text form (the peer URL)
 * is `host:port`, with IPv6 literals in brackets: `[::1]:42000`.
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    /**
     * Builds an address from its parts, normalizing the host the same way
     * `parse` does.
     *
     * # Arguments
     *
     * `host` - IP literal or host name, without brackets.
     *
     * `port` - Port in `[1, 65535]`.
     */
    pub fn new<H: AsRef<str>>(host: H, port: u16) -> Result<PeerAddress, Error> {
        let text = host.as_ref();

        if port == 0 {
            return Err(format_error(text, "port must be in [1, 65535]"));
        }

        Ok(PeerAddress {
            host: normalize_host(text).map_err(|reason| format_error(text, reason))?,
            port,
        })
    }

    /**
     * Parses a peer URL.
     *
     * # Arguments
     *
     * `text` - `host:port` or `[ipv6]:port`.
     */
    pub fn parse(text: &str) -> Result<PeerAddress, Error> {
        let trimmed = text.trim();

        let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format_error(text, "unterminated IPv6 literal"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| format_error(text, "missing port"))?;

            if host.parse::<Ipv6Addr>().is_err() {
                return Err(format_error(text, "bracketed host is not an IPv6 literal"));
            }
            (host, port)
        } else {
            let (host, port) = trimmed
                .rsplit_once(':')
                .ok_or_else(|| format_error(text, "missing port"))?;

            if host.contains(':') {
                return Err(format_error(text, "IPv6 literals must be bracketed"));
            }
            (host, port)
        };

        let port = parse_port(port).map_err(|reason| format_error(text, reason))?;
        let host = normalize_host(host).map_err(|reason| format_error(text, reason))?;

        Ok(PeerAddress { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /**
     * Resolves the host to every socket address it names. Fails when the name
     * does not resolve or resolves to nothing.
     */
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, Error> {
        let resolved: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| Error::Resolve {
                address: self.clone(),
                source,
            })?
            .collect();

        if resolved.is_empty() {
            return Err(Error::Resolve {
                address: self.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ),
            });
        }

        Ok(resolved)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerAddress::parse(s)
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PeerAddress::parse(&value)
    }
}

impl From<PeerAddress> for String {
    fn from(address: PeerAddress) -> Self {
        address.to_string()
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(address: SocketAddr) -> Self {
        PeerAddress {
            host: address.ip().to_string(),
            port: address.port(),
        }
    }
}

fn format_error(input: &str, reason: &'static str) -> Error {
    Error::PeerUrlFormat {
        input: input.to_string(),
        reason,
    }
}

fn parse_port(text: &str) -> Result<u16, &'static str> {
    if text.is_empty() {
        return Err("missing port");
    }
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err("port is not a decimal number");
    }

    match text.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err("port must be in [1, 65535]"),
    }
}

//IP literals are rewritten in their shortest form, names are case-folded
fn normalize_host(host: &str) -> Result<String, &'static str> {
    if host.is_empty() {
        return Err("empty host");
    }
    if host.chars().any(|c| c.is_whitespace() || c == '/' || c == '[' || c == ']') {
        return Err("host contains invalid characters");
    }

    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(ip.to_string()),
        Err(_) if host.contains(':') => Err("host is not a valid IPv6 literal"),
        Err(_) => Ok(host.to_ascii_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_names_and_literals() {
        let address = PeerAddress::parse("LocalHost:42000").unwrap();
        assert_eq!(address.host(), "localhost");
        assert_eq!(address.port(), 42000);

        let address = PeerAddress::parse("192.168.1.20:1").unwrap();
        assert_eq!(address.to_string(), "192.168.1.20:1");

        let address = PeerAddress::parse("[::0001]:65535").unwrap();
        assert_eq!(address.host(), "::1");
        assert_eq!(address.to_string(), "[::1]:65535");
    }

    #[test]
    fn rejects_malformed_urls() {
        for text in &[
            "",
            "localhost",
            "localhost:",
            ":42000",
            "localhost:port",
            "localhost:+80",
            "localhost:0",
            "localhost:65536",
            "localhost:-1",
            "::1:42000",
            "[::1]42000",
            "[::1:42000",
            "[example.org]:80",
            "bad host:80",
        ] {
            let error = PeerAddress::parse(text).unwrap_err();
            assert!(
                matches!(error, Error::PeerUrlFormat { .. }),
                "{:?} was not rejected as a format error",
                text
            );
        }
    }

    #[test]
    fn new_rejects_the_zero_port_and_empty_hosts() {
        assert!(PeerAddress::new("localhost", 0).is_err());
        assert!(PeerAddress::new("", 80).is_err());
        assert_eq!(
            PeerAddress::new("::1", 80).unwrap(),
            PeerAddress::parse("[::1]:80").unwrap()
        );
    }

    #[test]
    fn serializes_as_its_url() {
        let address = PeerAddress::parse("example.org:8080").unwrap();
        let encoded = toml::to_string(&Wrapper {
            peer: address.clone(),
        })
        .unwrap();

        assert_eq!(encoded.trim(), "peer = \"example.org:8080\"");
        let decoded: Wrapper = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.peer, address);
    }

    #[test]
    fn resolves_loopback() {
        let address = PeerAddress::parse("127.0.0.1:42000").unwrap();
        let resolved = address.resolve().unwrap();

        assert_eq!(resolved, vec!["127.0.0.1:42000".parse().unwrap()]);
    }

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        peer: PeerAddress,
    }

    fn host_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z][a-z0-9-]{0,20}(\\.[a-z][a-z0-9-]{0,10}){0,3}",
            any::<std::net::Ipv4Addr>().prop_map(|ip| ip.to_string()),
            any::<Ipv6Addr>().prop_map(|ip| format!("[{}]", ip)),
        ]
    }

    proptest! {
        #[test]
        fn format_of_parse_is_identity_on_canonical_urls(host in host_strategy(), port in 1u16..) {
            let text = format!("{}:{}", host, port);
            let address = PeerAddress::parse(&text).unwrap();

            prop_assert_eq!(address.to_string(), text);
            prop_assert_eq!(PeerAddress::parse(&address.to_string()).unwrap(), address);
        }

        #[test]
        fn out_of_range_ports_are_rejected(host in host_strategy(), port in 65536u32..10_000_000) {
            let text = format!("{}:{}", host, port);

            prop_assert!(PeerAddress::parse(&text).is_err());
        }
    }
}
