use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;

use anyhow::{anyhow, bail};


/// A [Contact] is the resolved (or partially resolved) address of a port: the carrier to use
///  for talking to it, its network location, and its logical name. It is an immutable value,
///  produced by name resolution or constructed directly.
#[derive(Clone, Eq, PartialEq, Hash, Default)]
pub struct Contact {
    carrier: String,
    host: String,
    port: Option<u16>,
    name: String,
}

impl Contact {
    pub fn new(name: &str, carrier: &str, host: &str, port: u16) -> Contact {
        Contact {
            carrier: carrier.to_string(),
            host: host.to_string(),
            port: Some(port),
            name: name.to_string(),
        }
    }

    /// a contact that is only known by its name, e.g. before resolution
    pub fn by_name(name: &str) -> Contact {
        Contact {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn from_socket_addr(name: &str, carrier: &str, addr: SocketAddr) -> Contact {
        Contact::new(name, carrier, &addr.ip().to_string(), addr.port())
    }

    /// Parses the textual forms of a contact:
    ///
    /// * `tcp://127.0.0.1:10002/name` (carrier, location and optional name)
    /// * `127.0.0.1:10002` (location only)
    /// * `text:/name` (carrier hint and name)
    /// * `/name` (name only)
    pub fn parse(s: &str) -> anyhow::Result<Contact> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty contact string");
        }

        if let Some((carrier, rest)) = s.split_once("://") {
            let (location, name) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, ""),
            };
            let mut result = Self::parse_location(location)?;
            result.carrier = carrier.to_string();
            result.name = if name == "/" { String::new() } else { name.to_string() };
            return Ok(result);
        }

        if s.starts_with('/') {
            return Ok(Contact::by_name(s));
        }

        if let Some((carrier, name)) = s.split_once(":/") {
            if !carrier.is_empty() && !carrier.contains('.') && name.parse::<u16>().is_err() {
                return Ok(Contact {
                    carrier: carrier.to_string(),
                    name: format!("/{}", name),
                    ..Default::default()
                });
            }
        }

        Self::parse_location(s)
    }

    fn parse_location(location: &str) -> anyhow::Result<Contact> {
        let (host, port) = location.rsplit_once(':')
            .ok_or_else(|| anyhow!("contact {:?} has no port number", location))?;
        let port = port.parse::<u16>()
            .map_err(|e| anyhow!("invalid port number in contact {:?}: {}", location, e))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            bail!("contact {:?} has no host", location);
        }
        Ok(Contact {
            host: host.to_string(),
            port: Some(port),
            ..Default::default()
        })
    }

    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// a contact is valid if it can be connected to, i.e. it has a network location
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port.is_some()
    }

    pub fn with_carrier(&self, carrier: &str) -> Contact {
        Contact {
            carrier: carrier.to_string(),
            ..self.clone()
        }
    }

    pub fn with_name(&self, name: &str) -> Contact {
        Contact {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn with_location(&self, host: &str, port: u16) -> Contact {
        Contact {
            host: host.to_string(),
            port: Some(port),
            ..self.clone()
        }
    }

    pub fn to_uri(&self) -> String {
        let carrier = if self.carrier.is_empty() { "tcp" } else { &self.carrier };
        match self.port {
            Some(port) if self.host.contains(':') => format!("{}://[{}]:{}{}", carrier, self.host, port, self.name),
            Some(port) => format!("{}://{}:{}{}", carrier, self.host, port, self.name),
            None => format!("{}:/{}", carrier, self.name.trim_start_matches('/')),
        }
    }
}

impl Display for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Contact({})", self.to_uri())
    }
}


/// A [Route] names the two ends of one connection and the carrier it uses. Each connection
///  unit has exactly one route.
#[derive(Clone, Eq, PartialEq, Hash, Default)]
pub struct Route {
    pub from_name: String,
    pub to_name: String,
    pub carrier_name: String,
}

impl Route {
    pub fn new(from_name: &str, to_name: &str, carrier_name: &str) -> Route {
        Route {
            from_name: from_name.to_string(),
            to_name: to_name.to_string(),
            carrier_name: carrier_name.to_string(),
        }
    }

    pub fn swap_names(&self) -> Route {
        Route {
            from_name: self.to_name.clone(),
            to_name: self.from_name.clone(),
            carrier_name: self.carrier_name.clone(),
        }
    }

    /// the carrier name without modifiers, i.e. the part before the first `+`
    pub fn base_carrier(&self) -> &str {
        split_carrier_name(&self.carrier_name).0
    }

    /// the carrier modifiers, i.e. everything after the first `+`
    pub fn carrier_modifiers(&self) -> Option<&str> {
        split_carrier_name(&self.carrier_name).1
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}->{}", self.from_name, self.carrier_name, self.to_name)
    }
}

impl Debug for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Route({})", self)
    }
}

pub fn split_carrier_name(carrier_name: &str) -> (&str, Option<&str>) {
    match carrier_name.split_once('+') {
        Some((base, modifiers)) => (base, Some(modifiers)),
        None => (carrier_name, None),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::full("tcp://127.0.0.1:10002/foo", Some(Contact::new("/foo", "tcp", "127.0.0.1", 10002)))]
    #[case::no_name("text://localhost:9", Some(Contact::new("", "text", "localhost", 9)))]
    #[case::trailing_slash("tcp://1.2.3.4:5/", Some(Contact::new("", "tcp", "1.2.3.4", 5)))]
    #[case::location_only("10.0.0.1:80", Some(Contact::new("", "", "10.0.0.1", 80)))]
    #[case::ipv6("tcp://[::1]:80/x", Some(Contact::new("/x", "tcp", "::1", 80)))]
    #[case::name_only("/camera/left", Some(Contact::by_name("/camera/left")))]
    #[case::carrier_hint("udp:/cam", Some(Contact::by_name("/cam").with_carrier("udp")))]
    #[case::no_port("tcp://localhost/x", None)]
    #[case::bad_port("1.2.3.4:abc", None)]
    #[case::empty("", None)]
    fn test_parse(#[case] s: &str, #[case] expected: Option<Contact>) {
        match Contact::parse(s) {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(e) => {
                println!("{}", e);
                assert!(expected.is_none());
            }
        }
    }

    #[rstest]
    #[case(Contact::new("/foo", "tcp", "127.0.0.1", 10002), "tcp://127.0.0.1:10002/foo")]
    #[case(Contact::new("", "", "localhost", 9), "tcp://localhost:9")]
    #[case(Contact::by_name("/x").with_carrier("udp"), "udp:/x")]
    fn test_to_uri(#[case] contact: Contact, #[case] expected: &str) {
        assert_eq!(contact.to_uri(), expected);
        assert_eq!(Contact::parse(expected).unwrap().to_uri(), expected);
    }

    #[rstest]
    #[case::plain("tcp", "tcp", None)]
    #[case::modifier("tcp+log.in", "tcp", Some("log.in"))]
    fn test_route_carrier(#[case] carrier: &str, #[case] base: &str, #[case] modifiers: Option<&str>) {
        let route = Route::new("/a", "/b", carrier);
        assert_eq!(route.base_carrier(), base);
        assert_eq!(route.carrier_modifiers(), modifiers);
    }

    #[test]
    fn test_validity() {
        assert!(Contact::new("/a", "tcp", "localhost", 1).is_valid());
        assert!(!Contact::by_name("/a").is_valid());
    }
}
