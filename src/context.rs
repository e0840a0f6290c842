use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::carrier::registry::CarrierRegistry;
use crate::namespace::multi::MultiNameSpace;
use crate::namespace::NameSpace;


/// environment variable naming the name space configuration file
pub const NAMESPACE_CONF_ENV: &str = "PORTNET_NAMESPACE_CONF";

/// Process-wide state shared by all ports: the carrier registry, the name space, and a
///  sequence for message and anonymous port numbering.
///
/// A context is created explicitly and passed to ports, which allows several independent
///  contexts in one process (e.g. for tests).
pub struct NetworkContext {
    carriers: Arc<CarrierRegistry>,
    namespace: MultiNameSpace,
    sequence: AtomicU64,
    default_timeout: Option<Duration>,
    host: String,
}

impl NetworkContext {
    /// A context whose name space is configured by the file that [NAMESPACE_CONF_ENV] points
    ///  to, if any.
    pub fn new() -> NetworkContext {
        let config_path = std::env::var_os(NAMESPACE_CONF_ENV).map(PathBuf::from);
        let carriers = Arc::new(CarrierRegistry::new());
        NetworkContext {
            namespace: MultiNameSpace::new(config_path, carriers.clone()),
            carriers,
            sequence: AtomicU64::new(1),
            default_timeout: None,
            host: "127.0.0.1".to_string(),
        }
    }

    pub fn with_namespace_config(mut self, path: impl Into<PathBuf>) -> NetworkContext {
        self.namespace = MultiNameSpace::new(Some(path.into()), self.carriers.clone());
        self
    }

    /// a name space made of the given backends in order, instead of a configuration file
    pub fn with_namespace_backends(mut self, spaces: Vec<Arc<dyn NameSpace>>) -> NetworkContext {
        self.namespace = MultiNameSpace::with_backends(spaces, self.carriers.clone());
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> NetworkContext {
        self.default_timeout = Some(timeout);
        self
    }

    /// the address that ports bind to and advertise
    pub fn with_host(mut self, host: &str) -> NetworkContext {
        self.host = host.to_string();
        self
    }

    pub fn carriers(&self) -> &Arc<CarrierRegistry> {
        &self.carriers
    }

    pub fn namespace(&self) -> &MultiNameSpace {
        &self.namespace
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Releases name space connections. Ports should be closed before this.
    pub async fn shutdown(&self) {
        self.namespace.deactivate().await;
    }
}

impl Default for NetworkContext {
    fn default() -> Self {
        NetworkContext::new()
    }
}
