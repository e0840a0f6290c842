use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::connection::reader::ConnectionReader;
use crate::contact::Contact;
use crate::context::NetworkContext;
use crate::payload::bottle::Bottle;
use crate::payload::{PortReader, PortWriter};
use crate::port::config::PortConfig;
use crate::port::incoming::ReadHandler;
use crate::port::Port;


/// marks the end of every name server response
pub const END_OF_MESSAGE: &str = "*** end of message";

/// stands for 'anything' / 'let the server choose' in registrations
const ANY: &str = "...";

pub const DEFAULT_BASE_PORT: u16 = 10000;

struct Record {
    contact: Contact,
}

/// The central registry: port names to addresses, with port numbers allocated per host from a
///  base port upward.
///
/// Requests are text commands, one per message (a bottle whose elements are the command's
///  words):
///
/// * `register <name> [<carrier> [<host> [<port>]]]` with `...` for values the server should
///   choose
/// * `unregister <name>`
/// * `query <name>`
/// * `list`
///
/// Responses are `registration name <name> ip <host> port <port> type <carrier>` lines,
///  terminated by [END_OF_MESSAGE].
pub struct NameServer {
    base_port: u16,
    records: FxHashMap<String, Record>,
    ports_in_use: FxHashMap<String, BTreeSet<u16>>,
    tmp_counter: u64,
}

impl NameServer {
    pub fn new(base_port: u16) -> NameServer {
        NameServer {
            base_port,
            records: Default::default(),
            ports_in_use: Default::default(),
            tmp_counter: 0,
        }
    }

    fn allocate_port(&mut self, host: &str) -> u16 {
        // the server's own port is base_port, allocation starts right after it
        let in_use = self.ports_in_use.entry(host.to_string()).or_default();
        let mut candidate = self.base_port.saturating_add(2);
        while in_use.contains(&candidate) {
            candidate = candidate.saturating_add(1);
        }
        in_use.insert(candidate);
        candidate
    }

    fn release_port(&mut self, host: &str, port: u16) {
        if let Some(in_use) = self.ports_in_use.get_mut(host) {
            in_use.remove(&port);
        }
    }

    /// Registers a name, filling in the carrier, host and port if they are not given. A previous
    ///  registration of the same name is replaced.
    pub fn register(&mut self, name: &str, carrier: Option<&str>, host: Option<&str>, port: Option<u16>) -> Contact {
        let name = if name == ANY {
            self.tmp_counter += 1;
            format!("/tmp/port/{}", self.tmp_counter)
        }
        else {
            self.unregister(name);
            name.to_string()
        };

        let carrier = carrier.filter(|c| *c != ANY).unwrap_or("tcp");
        let host = host.filter(|h| *h != ANY).unwrap_or("127.0.0.1");
        let port = match port.filter(|p| *p != 0) {
            Some(port) => {
                self.ports_in_use.entry(host.to_string()).or_default().insert(port);
                port
            }
            None => self.allocate_port(host),
        };

        let contact = Contact::new(&name, carrier, host, port);
        debug!("registering {}", contact);
        self.records.insert(name, Record { contact: contact.clone() });
        contact
    }

    pub fn unregister(&mut self, name: &str) -> Option<Contact> {
        let record = self.records.remove(name)?;
        if let Some(port) = record.contact.port() {
            let host = record.contact.host();
            let shared = self.records.values()
                .any(|r| r.contact.host() == host && r.contact.port() == Some(port));
            if !shared {
                self.release_port(host, port);
            }
        }
        debug!("unregistered {}", record.contact);
        Some(record.contact)
    }

    pub fn query(&self, name: &str) -> Option<Contact> {
        self.records.get(name).map(|r| r.contact.clone())
    }

    /// all registrations, ordered by name
    pub fn list(&self) -> Vec<Contact> {
        let mut result: Vec<Contact> = self.records.values().map(|r| r.contact.clone()).collect();
        result.sort_by(|a, b| a.name().cmp(b.name()));
        result
    }

    /// executes a text command, returning the response
    pub fn apply(&mut self, command: &[String]) -> String {
        let words: Vec<&str> = command.iter()
            .map(|s| s.as_str())
            .skip_while(|s| *s == "NAME_SERVER")
            .collect();

        let response = match words.as_slice() {
            ["register", name, rest @ ..] => {
                let port = match rest.get(2) {
                    Some(&ANY) | None => None,
                    Some(p) => match p.parse::<u16>() {
                        Ok(p) => Some(p),
                        Err(_) => return terminate(&format!("invalid port number {}\n", p)),
                    },
                };
                let contact = self.register(name, rest.first().copied(), rest.get(1).copied(), port);
                textify(Some(&contact))
            }
            ["unregister", name, ..] => textify(self.unregister(name).as_ref()),
            ["query", name, ..] => textify(self.query(name).as_ref()),
            ["list", ..] => self.list().iter()
                .map(|c| textify(Some(c)))
                .collect(),
            [] => "need a command\n".to_string(),
            other => format!("unknown command {}\n", other.join(" ")),
        };
        terminate(&response)
    }
}

fn terminate(response: &str) -> String {
    format!("{}{}", response, END_OF_MESSAGE)
}

/// the response line for a registration, empty for an unknown name
pub fn textify(contact: Option<&Contact>) -> String {
    match contact {
        Some(contact) => match contact.port() {
            Some(port) => format!("registration name {} ip {} port {} type {}\n", contact.name(), contact.host(), port, contact.carrier()),
            None => format!("registration name {} ip none port none type {}\n", contact.name(), contact.carrier()),
        },
        None => String::new(),
    }
}

/// Parses the first registration line of a name server response, `None` if the response has
///  none.
pub fn parse_registration(response: &str) -> Option<Contact> {
    let line = response.lines().find(|l| l.starts_with("registration "))?;
    let words: Vec<&str> = line.split_whitespace().collect();

    let value_of = |key: &str| words.iter()
        .position(|w| *w == key)
        .and_then(|idx| words.get(idx + 1))
        .copied();

    let name = value_of("name")?;
    let carrier = value_of("type").unwrap_or("tcp");
    match (value_of("ip"), value_of("port").and_then(|p| p.parse::<u16>().ok())) {
        (Some(host), Some(port)) if host != "none" => Some(Contact::new(name, carrier, host, port)),
        _ => Some(Contact::by_name(name).with_carrier(carrier)),
    }
}

/// serves a [NameServer] on a port
pub struct NameServerHandler {
    server: Mutex<NameServer>,
}

impl NameServerHandler {
    pub fn new(server: NameServer) -> NameServerHandler {
        NameServerHandler {
            server: Mutex::new(server),
        }
    }
}

#[async_trait]
impl ReadHandler for NameServerHandler {
    async fn on_read(&self, reader: &mut ConnectionReader) -> anyhow::Result<bool> {
        let mut request = Bottle::new();
        request.read(reader)?;
        let words: Vec<String> = request.iter()
            .map(|v| v.as_text().unwrap_or_else(|| v.to_string()))
            .collect();
        debug!("name server request {:?}", words);

        let response = self.server.lock().await.apply(&words);
        if let Some(writer) = reader.reply_writer() {
            let mut reply = Bottle::new();
            reply.add_string(&response);
            reply.write(writer)?;
        }
        Ok(true)
    }
}

/// Starts a name server listening at `address`, whose name is registered in its own table.
///  Port numbers are allocated upward from the server's own port.
pub async fn serve(context: Arc<NetworkContext>, address: &Contact) -> anyhow::Result<Port> {
    let config = PortConfig {
        control_registration: false,
        ..PortConfig::new()
    };
    let port = Port::new(context, config);
    port.listen(address).await?;

    let actual = match port.address() {
        Some(actual) => actual,
        None => bail!("name server port has no address"),
    };
    let base_port = actual.port().unwrap_or(DEFAULT_BASE_PORT);
    let mut server = NameServer::new(base_port);
    server.register(actual.name(), Some(actual.carrier()), Some(actual.host()), Some(base_port));

    port.set_read_handler(Arc::new(NameServerHandler::new(server)));
    port.start().await?;
    info!("name server listening at {}", actual);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_register_allocates_ports_per_host() {
        let mut server = NameServer::new(10000);
        let a = server.register("/a", None, Some("10.0.0.1"), None);
        let b = server.register("/b", None, Some("10.0.0.1"), None);
        let c = server.register("/c", None, Some("10.0.0.2"), None);

        assert_eq!(a, Contact::new("/a", "tcp", "10.0.0.1", 10002));
        assert_eq!(b.port(), Some(10003));
        assert_eq!(c.port(), Some(10002));

        // released ports are reused
        server.unregister("/a");
        assert_eq!(server.register("/d", None, Some("10.0.0.1"), None).port(), Some(10002));
    }

    #[test]
    fn test_reregister_replaces() {
        let mut server = NameServer::new(10000);
        server.register("/a", Some("text"), Some("10.0.0.1"), Some(12345));
        server.register("/a", None, Some("10.0.0.2"), Some(12346));

        assert_eq!(server.list(), vec![Contact::new("/a", "tcp", "10.0.0.2", 12346)]);
    }

    #[test]
    fn test_explicit_port_is_not_allocated_twice() {
        let mut server = NameServer::new(10000);
        server.register("/fixed", None, Some("h"), Some(10002));
        assert_eq!(server.register("/x", None, Some("h"), None).port(), Some(10003));
    }

    #[test]
    fn test_explicit_port_is_released_on_unregister() {
        let mut server = NameServer::new(10000);
        server.register("/fixed", None, Some("h"), Some(10002));
        server.register("/twin", None, Some("h"), Some(10002));

        // still held by /twin
        server.unregister("/fixed");
        assert_eq!(server.register("/x", None, Some("h"), None).port(), Some(10003));

        server.unregister("/twin");
        assert_eq!(server.register("/y", None, Some("h"), None).port(), Some(10002));
    }

    #[test]
    fn test_anonymous_names() {
        let mut server = NameServer::new(10000);
        let a = server.register("...", None, None, None);
        let b = server.register("...", None, None, None);
        assert!(a.name().starts_with("/tmp/port/"));
        assert_ne!(a.name(), b.name());
    }

    #[rstest]
    #[case::register("register /a tcp 10.0.0.1 12000", "registration name /a ip 10.0.0.1 port 12000 type tcp\n*** end of message")]
    #[case::register_any("register /a ... 10.0.0.1 ...", "registration name /a ip 10.0.0.1 port 10002 type tcp\n*** end of message")]
    #[case::prefixed("NAME_SERVER query /root", "registration name /root ip 127.0.0.1 port 10000 type tcp\n*** end of message")]
    #[case::query_unknown("query /nope", "*** end of message")]
    #[case::unknown("frobnicate", "unknown command frobnicate\n*** end of message")]
    #[case::bad_port("register /a tcp h x", "invalid port number x\n*** end of message")]
    fn test_apply(#[case] command: &str, #[case] expected: &str) {
        let mut server = NameServer::new(10000);
        server.register("/root", None, None, Some(10000));
        assert_eq!(server.apply(&words(command)), expected);
    }

    #[test]
    fn test_list_is_sorted() {
        let mut server = NameServer::new(10000);
        server.register("/b", None, None, Some(2));
        server.register("/a", None, None, Some(1));
        assert_eq!(
            server.apply(&words("list")),
            "registration name /a ip 127.0.0.1 port 1 type tcp\nregistration name /b ip 127.0.0.1 port 2 type tcp\n*** end of message",
        );
    }

    #[rstest]
    #[case::full("registration name /a ip 10.0.0.1 port 10002 type tcp\n*** end of message", Some(Contact::new("/a", "tcp", "10.0.0.1", 10002)))]
    #[case::crlf("registration name /a ip h port 1 type text\r\n*** end of message", Some(Contact::new("/a", "text", "h", 1)))]
    #[case::no_address("registration name /a ip none port none type tcp\n*** end of message", Some(Contact::by_name("/a").with_carrier("tcp")))]
    #[case::unknown("*** end of message", None)]
    fn test_parse_registration(#[case] response: &str, #[case] expected: Option<Contact>) {
        assert_eq!(parse_registration(response), expected);
    }
}
