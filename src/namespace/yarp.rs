use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tracing::debug;

use crate::carrier::registry::CarrierRegistry;
use crate::contact::Contact;
use crate::namespace::server::{parse_registration, END_OF_MESSAGE};
use crate::namespace::{NameSpace, NameSpaceFlags};
use crate::network::request;
use crate::payload::bottle::Bottle;


const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a central name server (see [crate::namespace::server::NameServer])
pub struct YarpNameSpace {
    server: Contact,
    carriers: Arc<CarrierRegistry>,
}

impl YarpNameSpace {
    pub fn new(server: Contact, carriers: Arc<CarrierRegistry>) -> YarpNameSpace {
        YarpNameSpace { server, carriers }
    }

    pub fn server(&self) -> &Contact {
        &self.server
    }

    async fn send_command(&self, words: &[&str]) -> anyhow::Result<String> {
        let mut command = Bottle::new();
        for word in words {
            command.add_string(word);
        }

        let mut reply = Bottle::new();
        request(&self.carriers, &self.server, &command, &mut reply, false, Some(REQUEST_TIMEOUT)).await?;

        let response = match reply.get(0).and_then(|v| v.as_str()) {
            Some(response) => response.to_string(),
            None => bail!("unexpected name server response {}", reply),
        };
        if !response.ends_with(END_OF_MESSAGE) {
            bail!("incomplete name server response {:?}", response);
        }
        debug!("name server: {:?} -> {:?}", words, response);
        Ok(response)
    }

    async fn register(&self, words: &[&str]) -> anyhow::Result<Contact> {
        let response = self.send_command(words).await?;
        match parse_registration(&response) {
            Some(contact) => Ok(contact),
            None => bail!("registration failed: {}", response),
        }
    }
}

#[async_trait]
impl NameSpace for YarpNameSpace {
    fn flags(&self) -> NameSpaceFlags {
        NameSpaceFlags {
            local_only: false,
            uses_central_server: true,
            server_allocates_port_numbers: true,
            connection_has_name_of_endpoints: true,
        }
    }

    async fn query_name(&self, name: &str) -> anyhow::Result<Option<Contact>> {
        let response = self.send_command(&["query", name]).await?;
        Ok(parse_registration(&response))
    }

    async fn register_name(&self, name: &str) -> anyhow::Result<Contact> {
        self.register(&["register", name]).await
    }

    async fn register_contact(&self, contact: &Contact) -> anyhow::Result<Contact> {
        let carrier = if contact.carrier().is_empty() { "..." } else { contact.carrier() };
        let host = if contact.host().is_empty() { "..." } else { contact.host() };
        let port = contact.port()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "...".to_string());
        self.register(&["register", contact.name(), carrier, host, &port]).await
    }

    async fn unregister_name(&self, name: &str) -> anyhow::Result<()> {
        self.send_command(&["unregister", name]).await?;
        Ok(())
    }

    async fn unregister_contact(&self, contact: &Contact) -> anyhow::Result<()> {
        self.unregister_name(contact.name()).await
    }
}

#[cfg(test)]
mod tests {
    use crate::context::NetworkContext;
    use crate::namespace::server::serve;
    use super::*;

    async fn start_server() -> (Arc<NetworkContext>, crate::port::Port, Contact) {
        let context = Arc::new(NetworkContext::new());
        let port = serve(context.clone(), &Contact::new("/root", "tcp", "127.0.0.1", 0)).await.unwrap();
        let address = port.address().unwrap();
        (context, port, address)
    }

    #[tokio::test]
    async fn test_against_name_server() {
        let (context, server_port, address) = start_server().await;
        let client = YarpNameSpace::new(address.clone(), context.carriers().clone());

        assert_eq!(client.query_name("/a").await.unwrap(), None);

        let registered = client.register_contact(&Contact::new("/a", "tcp", "127.0.0.1", 23456)).await.unwrap();
        assert_eq!(registered, Contact::new("/a", "tcp", "127.0.0.1", 23456));
        assert_eq!(client.query_name("/a").await.unwrap(), Some(registered));

        let allocated = client.register_name("/b").await.unwrap();
        assert!(allocated.is_valid());

        client.unregister_name("/a").await.unwrap();
        assert_eq!(client.query_name("/a").await.unwrap(), None);

        server_port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_text_carrier() {
        let (context, server_port, address) = start_server().await;
        let client = YarpNameSpace::new(address.with_carrier("text"), context.carriers().clone());

        let registered = client.register_contact(&Contact::new("/t", "text", "127.0.0.1", 23457)).await.unwrap();
        assert_eq!(client.query_name("/t").await.unwrap(), Some(registered));

        server_port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let client = YarpNameSpace::new(Contact::new("/root", "tcp", "127.0.0.1", 1), Arc::new(CarrierRegistry::new()));
        assert!(client.query_name("/a").await.is_err());
    }
}
