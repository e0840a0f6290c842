use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::carrier::registry::CarrierRegistry;
use crate::contact::Contact;
use crate::namespace::bridge::ForeignBridgeNameSpace;
use crate::namespace::config::{NameSpaceConfig, NameSpaceEntry, NameSpaceMode};
use crate::namespace::local::LocalNameSpace;
use crate::namespace::yarp::YarpNameSpace;
use crate::namespace::{NameSpace, NameSpaceFlags};


const MISSING_CONFIG_WARNING_INTERVAL: Duration = Duration::from_secs(3);

struct Backends {
    spaces: Vec<Arc<dyn NameSpace>>,
    flags: NameSpaceFlags,
    /// no configuration was found, ports run anonymous
    unconfigured: bool,
}

impl Backends {
    fn new(spaces: Vec<Arc<dyn NameSpace>>, unconfigured: bool) -> Backends {
        let flags = NameSpaceFlags::combine(spaces.iter().map(|s| s.flags()));
        Backends { spaces, flags, unconfigured }
    }
}

/// The name space a [crate::context::NetworkContext] works with: an ordered list of backends.
///  Registrations go to all backends, queries return the first backend's answer that has an
///  address.
///
/// Backends are created lazily from the configuration file on first use. Without a
///  configuration, names are not registered anywhere and ports are reachable only by address.
pub struct MultiNameSpace {
    config_path: Option<PathBuf>,
    carriers: Arc<CarrierRegistry>,
    backends: RwLock<Option<Arc<Backends>>>,
    last_missing_config_warning: Mutex<Option<Instant>>,
}

impl MultiNameSpace {
    pub fn new(config_path: Option<PathBuf>, carriers: Arc<CarrierRegistry>) -> MultiNameSpace {
        MultiNameSpace {
            config_path,
            carriers,
            backends: RwLock::new(None),
            last_missing_config_warning: Mutex::new(None),
        }
    }

    /// a name space with the given backends, bypassing configuration
    pub fn with_backends(spaces: Vec<Arc<dyn NameSpace>>, carriers: Arc<CarrierRegistry>) -> MultiNameSpace {
        MultiNameSpace {
            config_path: None,
            carriers,
            backends: RwLock::new(Some(Arc::new(Backends::new(spaces, false)))),
            last_missing_config_warning: Mutex::new(None),
        }
    }

    /// appends a backend, activating the configured ones first if that did not happen yet
    pub async fn add_backend(&self, space: Arc<dyn NameSpace>) {
        let current = self.active().await;
        let mut spaces = current.spaces.clone();
        spaces.push(space);
        *self.backends.write().await = Some(Arc::new(Backends::new(spaces, false)));
    }

    /// Drops all backends. They are recreated from the configuration on next use.
    pub async fn deactivate(&self) {
        *self.backends.write().await = None;
    }

    pub async fn flags(&self) -> NameSpaceFlags {
        self.active().await.flags
    }

    /// the carriers that name server backends connect with
    pub fn carriers(&self) -> &Arc<CarrierRegistry> {
        &self.carriers
    }

    pub async fn num_backends(&self) -> usize {
        self.active().await.spaces.len()
    }

    async fn active(&self) -> Arc<Backends> {
        if let Some(backends) = self.backends.read().await.as_ref() {
            return backends.clone();
        }

        let mut guard = self.backends.write().await;
        if let Some(backends) = guard.as_ref() {
            return backends.clone();
        }
        let backends = Arc::new(self.activate());
        *guard = Some(backends.clone());
        backends
    }

    fn activate(&self) -> Backends {
        let path = match &self.config_path {
            Some(path) => path,
            None => return Backends::new(Vec::new(), true),
        };
        let config = match NameSpaceConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("no usable name space configuration: {:#}", e);
                return Backends::new(Vec::new(), true);
            }
        };

        let mut spaces = Vec::new();
        for entry in &config.namespace {
            match self.create_backend(entry) {
                Ok(space) => spaces.push(space),
                Err(e) => warn!("skipping name space {:?}: {}", entry.mode, e),
            }
        }
        info!("activated {} name space backend(s) from {:?}", spaces.len(), path);
        Backends::new(spaces, false)
    }

    fn create_backend(&self, entry: &NameSpaceEntry) -> anyhow::Result<Arc<dyn NameSpace>> {
        let address = || -> anyhow::Result<Contact> {
            let address = entry.address.as_deref()
                .ok_or_else(|| anyhow!("no address configured"))?;
            Contact::parse(address)
        };

        Ok(match entry.mode {
            NameSpaceMode::YarpRegistry => Arc::new(YarpNameSpace::new(address()?, self.carriers.clone())),
            NameSpaceMode::ForeignBridge => Arc::new(ForeignBridgeNameSpace::new(address()?, self.carriers.clone())),
            NameSpaceMode::Local => Arc::new(LocalNameSpace::new()),
        })
    }

    fn warn_unconfigured(&self, operation: &str, name: &str) {
        let now = Instant::now();
        let should_warn = match self.last_missing_config_warning.lock() {
            Ok(mut last) => {
                let due = last.map_or(true, |t| now.duration_since(t) >= MISSING_CONFIG_WARNING_INTERVAL);
                if due {
                    *last = Some(now);
                }
                due
            }
            Err(_) => false,
        };
        if should_warn {
            warn!("no name space is configured, cannot {} {}", operation, name);
        }
        else {
            debug!("no name space is configured, cannot {} {}", operation, name);
        }
    }

    pub async fn query_name(&self, name: &str) -> anyhow::Result<Option<Contact>> {
        let backends = self.active().await;
        if backends.unconfigured {
            self.warn_unconfigured("look up", name);
        }

        let mut num_failed = 0;
        let mut last_error = None;
        for space in &backends.spaces {
            match space.query_name(name).await {
                Ok(Some(contact)) if contact.is_valid() => return Ok(Some(contact)),
                Ok(_) => {}
                Err(e) => {
                    debug!("name space lookup of {} failed: {}", name, e);
                    num_failed += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if num_failed == backends.spaces.len() => Err(e),
            _ => Ok(None),
        }
    }

    /// Registers a bare name with all backends, returning the first valid contact any backend
    ///  assigned (e.g. an allocated port number).
    pub async fn register_name(&self, name: &str) -> anyhow::Result<Contact> {
        let backends = self.active().await;
        if backends.unconfigured {
            self.warn_unconfigured("register", name);
            return Ok(Contact::by_name(name));
        }

        let results = Self::broadcast(&backends, |space| {
            let name = name.to_string();
            async move { space.register_name(&name).await }
        }).await?;
        Ok(Self::first_valid(results).unwrap_or_else(|| Contact::by_name(name)))
    }

    pub async fn register_contact(&self, contact: &Contact) -> anyhow::Result<Contact> {
        let backends = self.active().await;
        if backends.unconfigured {
            self.warn_unconfigured("register", contact.name());
            return Ok(contact.clone());
        }

        let results = Self::broadcast(&backends, |space| {
            let contact = contact.clone();
            async move { space.register_contact(&contact).await }
        }).await?;
        Ok(Self::first_valid(results).unwrap_or_else(|| contact.clone()))
    }

    pub async fn unregister_name(&self, name: &str) -> anyhow::Result<()> {
        let backends = self.active().await;
        Self::broadcast(&backends, |space| {
            let name = name.to_string();
            async move { space.unregister_name(&name).await }
        }).await?;
        Ok(())
    }

    pub async fn unregister_contact(&self, contact: &Contact) -> anyhow::Result<()> {
        let backends = self.active().await;
        Self::broadcast(&backends, |space| {
            let contact = contact.clone();
            async move { space.unregister_contact(&contact).await }
        }).await?;
        Ok(())
    }

    /// Runs an operation on all backends, in order. Fails only if all backends failed.
    async fn broadcast<T, F, Fut>(backends: &Backends, f: F) -> anyhow::Result<Vec<T>>
    where
        F: Fn(Arc<dyn NameSpace>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut results = Vec::new();
        let mut last_error = None;
        for space in &backends.spaces {
            match f(space.clone()).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!("name space operation failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if results.is_empty() => Err(e),
            _ => Ok(results),
        }
    }

    fn first_valid(results: Vec<Contact>) -> Option<Contact> {
        results.into_iter().find(|c| c.is_valid())
    }
}
