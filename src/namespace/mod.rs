pub mod bridge;
pub mod config;
pub mod local;
pub mod multi;
pub mod server;
pub mod yarp;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::contact::Contact;


/// Capabilities of a name space. These are combined across the backends of a
///  [multi::MultiNameSpace].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct NameSpaceFlags {
    /// names are only visible within this process
    pub local_only: bool,
    pub uses_central_server: bool,
    /// registering a bare name returns a port number to listen on
    pub server_allocates_port_numbers: bool,
    /// a connection's handshake carries the names of both endpoints
    pub connection_has_name_of_endpoints: bool,
}

impl NameSpaceFlags {
    /// Combines the flags of several backends: `local_only`, `server_allocates_port_numbers`
    ///  and `connection_has_name_of_endpoints` hold only if they hold for all backends,
    ///  `uses_central_server` holds if it holds for any backend. Without backends, names are
    ///  local only.
    pub fn combine(flags: impl IntoIterator<Item = NameSpaceFlags>) -> NameSpaceFlags {
        let mut result: Option<NameSpaceFlags> = None;
        for f in flags {
            result = Some(match result {
                None => f,
                Some(r) => NameSpaceFlags {
                    local_only: r.local_only && f.local_only,
                    uses_central_server: r.uses_central_server || f.uses_central_server,
                    server_allocates_port_numbers: r.server_allocates_port_numbers && f.server_allocates_port_numbers,
                    connection_has_name_of_endpoints: r.connection_has_name_of_endpoints && f.connection_has_name_of_endpoints,
                },
            });
        }
        result.unwrap_or(NameSpaceFlags {
            local_only: true,
            ..Default::default()
        })
    }
}

/// A directory mapping port names to network addresses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NameSpace: Send + Sync + 'static {
    fn flags(&self) -> NameSpaceFlags;

    /// `None` if the name is not registered
    async fn query_name(&self, name: &str) -> anyhow::Result<Option<Contact>>;

    /// Registers a name without an address. Name spaces that allocate port numbers return the
    ///  address the port should listen on.
    async fn register_name(&self, name: &str) -> anyhow::Result<Contact>;

    async fn register_contact(&self, contact: &Contact) -> anyhow::Result<Contact>;

    async fn unregister_name(&self, name: &str) -> anyhow::Result<()>;

    async fn unregister_contact(&self, contact: &Contact) -> anyhow::Result<()>;
}
