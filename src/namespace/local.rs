use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::contact::Contact;
use crate::namespace::{NameSpace, NameSpaceFlags};


/// An in-process name table, for ports that only talk to each other
#[derive(Default)]
pub struct LocalNameSpace {
    names: ArcSwap<FxHashMap<String, Contact>>,
}

impl LocalNameSpace {
    pub fn new() -> LocalNameSpace {
        LocalNameSpace::default()
    }

    pub fn names(&self) -> Vec<String> {
        let mut result: Vec<String> = self.names.load().keys().cloned().collect();
        result.sort();
        result
    }
}

#[async_trait]
impl NameSpace for LocalNameSpace {
    fn flags(&self) -> NameSpaceFlags {
        NameSpaceFlags {
            local_only: true,
            uses_central_server: false,
            server_allocates_port_numbers: false,
            connection_has_name_of_endpoints: true,
        }
    }

    async fn query_name(&self, name: &str) -> anyhow::Result<Option<Contact>> {
        Ok(self.names.load().get(name).cloned())
    }

    /// Reserves `name` without a location, keeping an existing registration.
    async fn register_name(&self, name: &str) -> anyhow::Result<Contact> {
        trace!("registering name {}", name);
        let mut result = Contact::by_name(name);
        self.names.rcu(|names| {
            if let Some(existing) = names.get(name) {
                result = existing.clone();
                return names.clone();
            }
            result = Contact::by_name(name);
            let mut names = FxHashMap::clone(names);
            names.insert(name.to_string(), result.clone());
            Arc::new(names)
        });
        Ok(result)
    }

    async fn register_contact(&self, contact: &Contact) -> anyhow::Result<Contact> {
        trace!("registering {}", contact);
        self.names.rcu(|names| {
            let mut names = FxHashMap::clone(names);
            names.insert(contact.name().to_string(), contact.clone());
            Arc::new(names)
        });
        Ok(contact.clone())
    }

    async fn unregister_name(&self, name: &str) -> anyhow::Result<()> {
        self.names.rcu(|names| {
            let mut names = FxHashMap::clone(names);
            names.remove(name);
            Arc::new(names)
        });
        Ok(())
    }

    async fn unregister_contact(&self, contact: &Contact) -> anyhow::Result<()> {
        self.unregister_name(contact.name()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_query_unregister() {
        let ns = LocalNameSpace::new();
        assert_eq!(ns.query_name("/a").await.unwrap(), None);

        let contact = Contact::new("/a", "tcp", "127.0.0.1", 10002);
        ns.register_contact(&contact).await.unwrap();
        assert_eq!(ns.query_name("/a").await.unwrap(), Some(contact.clone()));
        assert_eq!(ns.register_name("/a").await.unwrap(), contact);
        assert_eq!(ns.names(), vec!["/a".to_string()]);

        ns.unregister_contact(&contact).await.unwrap();
        assert_eq!(ns.query_name("/a").await.unwrap(), None);
        assert!(!ns.register_name("/a").await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_register_name_records_the_name() {
        let ns = LocalNameSpace::new();
        assert_eq!(ns.register_name("/b").await.unwrap(), Contact::by_name("/b"));
        assert_eq!(ns.names(), vec!["/b".to_string()]);
        assert_eq!(ns.query_name("/b").await.unwrap(), Some(Contact::by_name("/b")));

        // a later contact registration fills in the location
        let contact = Contact::new("/b", "tcp", "127.0.0.1", 10003);
        ns.register_contact(&contact).await.unwrap();
        assert_eq!(ns.register_name("/b").await.unwrap(), contact);

        ns.unregister_name("/b").await.unwrap();
        assert!(ns.names().is_empty());
    }
}
