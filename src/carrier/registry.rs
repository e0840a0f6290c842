use std::sync::Arc;

use anyhow::anyhow;
use arc_swap::ArcSwap;
use tracing::{debug, trace};

use crate::carrier::{Carrier, Header};
use crate::carrier::crc::CrcCarrier;
use crate::carrier::tcp::TcpCarrier;
use crate::carrier::text::TextCarrier;
use crate::carrier::udp::UdpCarrier;
use crate::contact::split_carrier_name;


/// The table of known carriers, looked up by name (when initiating a connection) and by header
///  (when accepting one). Registered carriers are prototypes: lookups return fresh instances.
pub struct CarrierRegistry {
    carriers: ArcSwap<Vec<Arc<dyn Carrier>>>,
}

impl Default for CarrierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CarrierRegistry {
    /// a registry with the built-in carriers
    pub fn new() -> CarrierRegistry {
        let carriers: Vec<Arc<dyn Carrier>> = vec![
            Arc::new(TcpCarrier::new(true)),
            Arc::new(TcpCarrier::new(false)),
            Arc::new(TextCarrier::new(false)),
            Arc::new(TextCarrier::new(true)),
            Arc::new(UdpCarrier::new()),
            Arc::new(CrcCarrier::new()),
        ];
        CarrierRegistry {
            carriers: ArcSwap::from_pointee(carriers),
        }
    }

    /// Adds a carrier, replacing a registered carrier of the same name.
    pub fn register(&self, carrier: Arc<dyn Carrier>) {
        debug!("registering carrier {}", carrier.name());
        self.carriers.rcu(|carriers| {
            let mut carriers = carriers.iter()
                .filter(|c| c.name() != carrier.name())
                .cloned()
                .collect::<Vec<_>>();
            carriers.push(carrier.clone());
            carriers
        });
    }

    /// Creates a carrier by name. Modifiers after a `+` are ignored for the lookup.
    pub fn choose(&self, name: &str) -> anyhow::Result<Box<dyn Carrier>> {
        let (base, _) = split_carrier_name(name);
        self.carriers.load()
            .iter()
            .find(|c| c.name() == base)
            .map(|c| c.create())
            .ok_or_else(|| anyhow!("unknown carrier {:?}", name))
    }

    /// Creates the carrier matching an incoming connection's header, with the header's
    ///  parameters applied.
    pub fn choose_by_header(&self, header: &Header) -> anyhow::Result<Box<dyn Carrier>> {
        let carriers = self.carriers.load();
        let prototype = carriers.iter()
            .find(|c| c.check_header(header))
            .ok_or_else(|| anyhow!("no carrier for header {:?}", header))?;

        let mut carrier = prototype.create();
        carrier.set_parameters(header);
        trace!("header {:?} selects carrier {}", header, carrier.name());
        Ok(carrier)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.carriers.load()
            .iter()
            .map(|c| c.name())
            .collect()
    }
}
