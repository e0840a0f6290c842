use std::time::Duration;


/// What a port is used for. Inbound data is refused by ports that are not inputs, and outputs
///  can only be added to output ports. An RPC port has at most one output connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PortFlags {
    pub input: bool,
    pub output: bool,
    pub rpc: bool,
}

impl PortFlags {
    pub const INPUT_OUTPUT: PortFlags = PortFlags { input: true, output: true, rpc: false };
    pub const RPC: PortFlags = PortFlags { input: true, output: true, rpc: true };
}

impl Default for PortFlags {
    fn default() -> Self {
        PortFlags::INPUT_OUTPUT
    }
}

#[derive(Debug, Clone)]
pub struct PortConfig {
    /// If set, a send waits until the previous send on this port completed before it starts
    ///  transmitting.
    pub wait_before_send: bool,
    /// If set, a send returns only after all destinations finished transmitting (or failed).
    pub wait_after_send: bool,

    /// Upper bound for a single blocking network operation, and for a blocking `read()`.
    ///
    /// NB: This is deliberately not applied to connections waiting idle for the next message.
    pub timeout: Option<Duration>,

    /// If not set, opening a port does not register its name, and closing does not unregister
    ///  it.
    pub control_registration: bool,

    pub flags: PortFlags,

    /// marks all outgoing messages as administrative, i.e. as commands for the receiving port
    ///  rather than for its application
    pub admin_mode: bool,

    /// the carrier that outgoing connections use unless one is given explicitly
    pub carrier: String,

    /// the interval of the sweep that removes connections which terminated
    pub gc_interval: Duration,

    /// number of received messages buffered for `read()` when no read handler is registered
    pub input_queue_len: usize,

    /// upper bound for an incoming connection's handshake
    pub handshake_timeout: Duration,
}

impl PortConfig {
    pub fn new() -> PortConfig {
        PortConfig {
            wait_before_send: true,
            wait_after_send: true,
            timeout: None,
            control_registration: true,
            flags: PortFlags::default(),
            admin_mode: false,
            carrier: "tcp".to_string(),
            gc_interval: Duration::from_millis(200),
            input_queue_len: 1,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// a configuration for sending requests and waiting for replies
    pub fn rpc() -> PortConfig {
        PortConfig {
            flags: PortFlags::RPC,
            ..PortConfig::new()
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig::new()
    }
}
