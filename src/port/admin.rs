use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::reader::ConnectionReader;
use crate::contact::Route;
use crate::payload::bottle::{Bottle, Value};
use crate::payload::PortReader;
use crate::port::PortCore;
use crate::util::vocab::{vocabs, Vocab};


const HELP: &[&str] = &[
    "[help]                       # this text",
    "[ver]                        # protocol version",
    "[add] $portname [$carrier]   # add an output connection",
    "[del] $portname              # remove connections to or from a port",
    "[list] [in]|[out] [$port]    # list connections, or describe one",
    "[set] [verb] $level          # set verbosity of connection events",
    "[set] [tout] $seconds        # set timeout, negative to disable",
    "[get] [verb]|[tout]          # read a setting",
    "[prop] [get] [$key]          # read user properties",
    "[prop] [set] $key $value     # set a user property",
];

/// Command tags arrive as vocabs from binary peers and as plain words from text mode peers.
fn tag_at(command: &Bottle, idx: usize) -> Option<Vocab> {
    match command.get(idx)? {
        Value::Vocab(v) => Some(*v),
        Value::String(s) => Vocab::try_from_str(s),
        _ => None,
    }
}

fn text_at(command: &Bottle, idx: usize) -> Option<String> {
    command.get(idx).and_then(|v| v.as_text())
}

fn ok() -> Bottle {
    Bottle::from_values(vec![Value::Vocab(vocabs::OK)])
}

fn fail(message: &str) -> Bottle {
    Bottle::from_values(vec![Value::Vocab(vocabs::FAIL), Value::from(message)])
}

fn describe_route(route: &Route) -> Bottle {
    let mut result = Bottle::new();
    result.add_list().add_string("from").add_string(&route.from_name);
    result.add_list().add_string("to").add_string(&route.to_name);
    result.add_list().add_string("carrier").add_string(&route.carrier_name);
    result
}

fn version() -> Bottle {
    let part = |s: &str| s.parse::<i32>().unwrap_or(0);
    let mut result = Bottle::new();
    result.add_vocab(vocabs::VER)
        .add_int32(part(env!("CARGO_PKG_VERSION_MAJOR")))
        .add_int32(part(env!("CARGO_PKG_VERSION_MINOR")))
        .add_int32(part(env!("CARGO_PKG_VERSION_PATCH")))
        .add_string(env!("CARGO_PKG_NAME"));
    result
}

impl PortCore {
    /// Executes an administrative command read from `reader`. Failures are reported in the
    ///  returned reply rather than as errors, since the reply is all the sender gets to see.
    pub async fn admin_block(&self, reader: &mut ConnectionReader) -> Bottle {
        let mut command = Bottle::new();
        if let Err(e) = command.read(reader) {
            warn!("{}: malformed administrative message from {}: {}", self.name(), reader.route().from_name, e);
            return fail("malformed command");
        }
        debug!("{}: administrative command {}", self.name(), command);

        match tag_at(&command, 0) {
            Some(vocabs::HELP) => {
                let mut result = Bottle::new();
                result.add_vocab(vocabs::MANY);
                for line in HELP {
                    result.add_string(line);
                }
                result
            }
            Some(vocabs::VER) => version(),
            Some(vocabs::ADD) => self.admin_add(&command).await,
            Some(vocabs::DEL) => self.admin_del(&command).await,
            Some(vocabs::LIST) => self.admin_list(&command),
            Some(vocabs::SET) => self.admin_set(&command),
            Some(vocabs::GET) => self.admin_get(&command),
            Some(vocabs::PROP) => self.admin_prop(&command),
            _ => fail("unknown command"),
        }
    }

    async fn admin_add(&self, command: &Bottle) -> Bottle {
        let target = match text_at(command, 1) {
            Some(target) => target,
            None => return fail("missing target port"),
        };
        let carrier = text_at(command, 2);

        match self.add_output(&target, carrier.as_deref()).await {
            Ok(_) => ok(),
            Err(e) => {
                warn!("{}: failed to connect to {}: {}", self.name(), target, e);
                fail(&e.to_string())
            }
        }
    }

    async fn admin_del(&self, command: &Bottle) -> Bottle {
        let target = match text_at(command, 1) {
            Some(target) => target,
            None => return fail("missing target port"),
        };

        match self.remove_connections_with(&target).await {
            Ok(0) => fail("no such connection"),
            Ok(_) => ok(),
            Err(e) => fail(&e.to_string()),
        }
    }

    fn admin_list(&self, command: &Bottle) -> Bottle {
        let direction = tag_at(command, 1);
        let routes: Vec<Route> = match direction {
            Some(vocabs::IN) => self.describe().inputs,
            Some(vocabs::OUT) => self.describe().outputs,
            _ => return fail("expected [in] or [out]"),
        };
        let peer_name = |r: &Route| if direction == Some(vocabs::IN) { r.from_name.clone() } else { r.to_name.clone() };

        match text_at(command, 2) {
            Some(peer) => match routes.iter().find(|r| peer_name(r) == peer) {
                Some(route) => describe_route(route),
                None => Bottle::new(),
            },
            None => {
                let mut result = Bottle::new();
                for route in &routes {
                    result.add_string(&peer_name(route));
                }
                result
            }
        }
    }

    fn admin_set(&self, command: &Bottle) -> Bottle {
        match tag_at(command, 1) {
            Some(vocabs::VERB) => match command.get(2).and_then(|v| v.as_i32()) {
                Some(level) => {
                    self.set_verbosity(level.clamp(0, u8::MAX as i32) as u8);
                    ok()
                }
                None => fail("expected a verbosity level"),
            },
            Some(vocabs::TOUT) => match command.get(2).and_then(|v| v.as_f64()) {
                Some(seconds) if seconds < 0.0 => {
                    self.set_timeout(None);
                    ok()
                }
                Some(seconds) => match Duration::try_from_secs_f64(seconds) {
                    Ok(timeout) => {
                        self.set_timeout(Some(timeout));
                        ok()
                    }
                    Err(_) => fail("invalid timeout"),
                },
                None => fail("expected a timeout in seconds"),
            },
            _ => fail("unknown setting"),
        }
    }

    fn admin_get(&self, command: &Bottle) -> Bottle {
        let mut result = Bottle::new();
        match tag_at(command, 1) {
            Some(vocabs::VERB) => {
                result.add_vocab(vocabs::IS).add_vocab(vocabs::VERB).add_int32(self.verbosity() as i32);
            }
            Some(vocabs::TOUT) => {
                let seconds = self.timeout().map(|t| t.as_secs_f64()).unwrap_or(-1.0);
                result.add_vocab(vocabs::IS).add_vocab(vocabs::TOUT).add_float64(seconds);
            }
            _ => return fail("unknown setting"),
        }
        result
    }

    fn admin_prop(&self, command: &Bottle) -> Bottle {
        match tag_at(command, 1) {
            Some(vocabs::GET) => match text_at(command, 2) {
                Some(key) => match self.property(&key) {
                    Some(value) => Bottle::from_values(vec![value]),
                    None => Bottle::new(),
                },
                None => {
                    let mut result = Bottle::new();
                    for (key, value) in self.properties() {
                        result.add_list().add_string(&key).add(value);
                    }
                    result
                }
            },
            Some(vocabs::SET) => match (text_at(command, 2), command.get(3)) {
                (Some(key), Some(value)) => {
                    self.set_property(&key, value.clone());
                    ok()
                }
                _ => fail("expected a key and a value"),
            },
            _ => fail("expected [get] or [set]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use rstest::rstest;
    use crate::context::NetworkContext;
    use crate::namespace::local::LocalNameSpace;
    use crate::port::config::PortConfig;
    use crate::port::Port;
    use super::*;

    fn context() -> Arc<NetworkContext> {
        Arc::new(NetworkContext::new().with_namespace_backends(vec![Arc::new(LocalNameSpace::new())]))
    }

    async fn run(port: &Port, command: &str) -> Bottle {
        port.admin_block(&Bottle::from_text(command).unwrap()).await.unwrap()
    }

    #[rstest]
    #[case::vocab("[add] /x")]
    #[case::plain_word("add /x")]
    #[case::vocab_with_carrier("[add] /x text")]
    fn test_tag_at(#[case] command: &str) {
        let command = Bottle::from_text(command).unwrap();
        assert_eq!(tag_at(&command, 0), Some(vocabs::ADD));
        assert_eq!(text_at(&command, 1), Some("/x".to_string()));
    }

    #[tokio::test]
    async fn test_settings() {
        let port = Port::new(context(), PortConfig::new());
        port.open("/admin").await.unwrap();

        assert_eq!(run(&port, "[set] [verb] 2").await, ok());
        assert_eq!(run(&port, "[get] [verb]").await, Bottle::from_text("[is] [verb] 2").unwrap());

        assert_eq!(run(&port, "[set] [tout] 1.5").await, ok());
        assert_eq!(port.core().timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(run(&port, "[get] [tout]").await, Bottle::from_text("[is] [tout] 1.5").unwrap());
        assert_eq!(run(&port, "[set] [tout] -1").await, ok());
        assert_eq!(port.core().timeout(), None);

        assert_eq!(run(&port, "[prop] [set] colour red").await, ok());
        assert_eq!(run(&port, "[prop] [get] colour").await, Bottle::from_text("red").unwrap());
        assert_eq!(run(&port, "[prop] [get] shape").await, Bottle::new());
        assert_eq!(run(&port, "[prop] [get]").await, Bottle::from_text("(colour red)").unwrap());

        port.close().await.unwrap();
    }

    #[rstest]
    #[case::unknown("[frob]")]
    #[case::empty("")]
    #[case::list_without_direction("[list]")]
    #[case::set_unknown("[set] [xyz] 1")]
    #[tokio::test]
    async fn test_failures(#[case] command: &str) {
        let port = Port::new(context(), PortConfig::new());
        port.open("/failing").await.unwrap();

        let reply = run(&port, command).await;
        assert_eq!(reply.get(0), Some(&Value::Vocab(vocabs::FAIL)));
        port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_help_and_version() {
        let port = Port::new(context(), PortConfig::new());
        port.open("/helpful").await.unwrap();

        let help = run(&port, "[help]").await;
        assert_eq!(help.get(0), Some(&Value::Vocab(vocabs::MANY)));
        assert_eq!(help.size(), HELP.len() + 1);
        assert_eq!(run(&port, "[ver]").await.get(0), Some(&Value::Vocab(vocabs::VER)));

        port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_connect_list_disconnect() {
        let context = context();
        let source = Port::new(context.clone(), PortConfig::new());
        source.open("/src").await.unwrap();
        let target = Port::new(context.clone(), PortConfig::new());
        target.open("/dst").await.unwrap();

        crate::network::connect(&context, "/src", "/dst", Some("text")).await.unwrap();
        assert_eq!(source.output_count(), 1);

        assert_eq!(run(&source, "[list] [out]").await, Bottle::from_text("/dst").unwrap());
        assert_eq!(
            run(&source, "[list] [out] /dst").await,
            Bottle::from_text("(from /src) (to /dst) (carrier text)").unwrap(),
        );
        assert_eq!(run(&source, "[list] [out] /other").await, Bottle::new());

        // the target's input shows up once its handshake went through
        tokio::time::timeout(Duration::from_secs(1), async {
            while target.input_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
        assert_eq!(run(&target, "[list] [in]").await, Bottle::from_text("/src").unwrap());

        crate::network::disconnect(&context, "/src", "/dst").await.unwrap();
        assert_eq!(source.output_count(), 0);
        assert!(crate::network::disconnect(&context, "/src", "/dst").await.is_err());

        source.close().await.unwrap();
        target.close().await.unwrap();
    }
}
