use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tracing::debug;

use crate::carrier::registry::CarrierRegistry;
use crate::contact::Contact;
use crate::namespace::{NameSpace, NameSpaceFlags};
use crate::network::request;
use crate::payload::bottle::Bottle;


const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CALLER_ID: &str = "dummy_id";
/// the status code of a successful foreign registry call
const SUCCESS: i32 = 1;

/// Converts a port name to the foreign registry's naming rules: `:` is not allowed there and
///  becomes `__`.
pub fn to_foreign_name(name: &str) -> String {
    name.replace(':', "__")
}

/// The inverse of [to_foreign_name]: every `__` becomes `:`, single underscores are kept.
pub fn from_foreign_name(name: &str) -> String {
    if !name.contains("__") {
        return name.to_string();
    }

    let mut result = String::with_capacity(name.len());
    let mut underscores = 0;
    for c in name.chars() {
        if c == '_' {
            underscores += 1;
            if underscores == 2 {
                result.push(':');
                underscores = 0;
            }
        }
        else {
            if underscores != 0 {
                result.push('_');
                underscores = 0;
            }
            result.push(c);
        }
    }
    if underscores != 0 {
        result.push('_');
    }
    result
}

/// Client for a foreign registry that knows nodes and services rather than ports. Lookups try
///  the name as a node first, then as a service. The registry cannot allocate port numbers or
///  register bare names.
pub struct ForeignBridgeNameSpace {
    registry: Contact,
    carriers: Arc<CarrierRegistry>,
}

impl ForeignBridgeNameSpace {
    pub fn new(registry: Contact, carriers: Arc<CarrierRegistry>) -> ForeignBridgeNameSpace {
        ForeignBridgeNameSpace { registry, carriers }
    }

    /// sends a call, returning the reply if its status code signals success
    async fn call(&self, words: &[&str]) -> anyhow::Result<Option<Bottle>> {
        let mut command = Bottle::new();
        for word in words {
            command.add_string(word);
        }

        let mut reply = Bottle::new();
        request(&self.carriers, &self.registry, &command, &mut reply, false, Some(REQUEST_TIMEOUT)).await?;
        debug!("foreign registry: {:?} -> {}", words, reply);

        if reply.get(0).and_then(|v| v.as_i32()) == Some(SUCCESS) {
            Ok(Some(reply))
        }
        else {
            Ok(None)
        }
    }
}

#[async_trait]
impl NameSpace for ForeignBridgeNameSpace {
    fn flags(&self) -> NameSpaceFlags {
        NameSpaceFlags {
            local_only: false,
            uses_central_server: true,
            server_allocates_port_numbers: false,
            connection_has_name_of_endpoints: false,
        }
    }

    async fn query_name(&self, name: &str) -> anyhow::Result<Option<Contact>> {
        let foreign_name = to_foreign_name(name);

        let reply = match self.call(&["lookupNode", CALLER_ID, &foreign_name]).await? {
            Some(reply) => reply,
            None => match self.call(&["lookupService", CALLER_ID, &foreign_name]).await? {
                Some(reply) => reply,
                None => return Ok(None),
            },
        };

        let uri = match reply.get(2).and_then(|v| v.as_str()) {
            Some(uri) => uri,
            None => bail!("foreign registry reply without address: {}", reply),
        };
        Ok(Some(Contact::parse(uri)?.with_name(name)))
    }

    async fn register_name(&self, name: &str) -> anyhow::Result<Contact> {
        bail!("the foreign registry cannot register {} without an address", name)
    }

    async fn register_contact(&self, contact: &Contact) -> anyhow::Result<Contact> {
        let foreign_name = to_foreign_name(contact.name());
        let uri = contact.to_uri();
        match self.call(&["registerService", CALLER_ID, &foreign_name, &uri, &uri]).await? {
            Some(_) => Ok(contact.clone()),
            None => bail!("foreign registry rejected registration of {}", contact),
        }
    }

    async fn unregister_name(&self, name: &str) -> anyhow::Result<()> {
        match self.query_name(name).await? {
            Some(contact) => self.unregister_contact(&contact).await,
            None => Ok(()),
        }
    }

    async fn unregister_contact(&self, contact: &Contact) -> anyhow::Result<()> {
        let foreign_name = to_foreign_name(contact.name());
        let uri = contact.to_uri();
        if self.call(&["unregisterService", CALLER_ID, &foreign_name, &uri]).await?.is_none() {
            debug!("foreign registry did not know {}", contact);
        }
        Ok(())
    }
}
