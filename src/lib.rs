//! Named ports that exchange messages over pluggable carriers, for connecting the components of
//!  a robot (or any other set of processes) without them knowing about each other's location.
//!
//! ## Concepts
//!
//! * A *port* is a named endpoint. It listens on a TCP socket, and every message written to it
//!    goes to all of its output connections. Messages arriving on its input connections go to a
//!    read handler, or are queued for `read()`.
//!   * Connections are directed and belong to the port that created them: the sending port owns
//!      its outputs, the receiving port owns its inputs.
//!   * Every connection is run by its own task (a *connection unit*), so a slow receiver only
//!      delays the messages queued for it.
//! * A *carrier* is the protocol spoken on one connection. The connecting side picks it, the
//!    accepting side recognizes it from the first eight bytes sent.
//! * The *name space* maps port names to network addresses. It combines several backends (an
//!    in-process registry, a central name server, a bridge to a foreign registry) configured in
//!    a TOML file.
//!
//! ## Wire format
//!
//! Every connection starts with a handshake:
//!
//! ```ascii
//! 0: carrier specific header (8 bytes), e.g. 'Y' 'A' 0x83 0x1E 0 0 'R' 'P' for tcp
//! 8: length of the sender's port name (u32 LE), followed by the name, NUL terminated
//! *: carrier specific extra header, possibly empty
//! ```
//!
//! The accepting side replies with a carrier specific header. The binary carriers then frame
//!  each message as
//!
//! ```ascii
//! 0: flags (u32 LE): bit 0 'reply expected', bit 1 'administrative', bit 2 'envelope'
//! 4: number of blocks (u32 LE)
//! *: (repeated) block length (u32 LE)
//! *: the blocks' bytes
//! ```
//!
//! followed by an ack ('Y' 'A' 0 0 0 0 'R' 'P') if the carrier requires one. The text carriers
//!  send a command line (`d` data, `r` data with reply, `a` administrative, `q` quit) and one
//!  line of payload instead.
//!
//! ## Administrative commands
//!
//! Every port understands a set of commands flagged as administrative, regardless of its read
//!  handler: listing, adding and removing connections, changing verbosity and timeout, and user
//!  properties. See [port::admin].

pub mod carrier;
pub mod connection;
pub mod contact;
pub mod context;
pub mod namespace;
pub mod network;
pub mod payload;
pub mod port;
pub mod util;
