use anyhow::bail;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::carrier::{Carrier, Header, MessageFlags};
use crate::carrier::registry::CarrierRegistry;
use crate::connection::reader::ConnectionReader;
use crate::connection::state::{interruptible, ConnectionControl, ConnectionState};
use crate::connection::stream::{IoStream, TwoWayStream};
use crate::connection::writer::BufferedConnectionWriter;
use crate::contact::{Contact, Route};


/// A [Connection] is one end of a negotiated connection: a carrier instance together with the
///  connection state it drives. It is owned by exactly one connection unit.
pub struct Connection {
    carrier: Box<dyn Carrier>,
    state: ConnectionState,
}

impl Connection {
    /// Connects to a remote port and runs the originating side of the handshake.
    pub async fn connect(
        registry: &CarrierRegistry,
        target: &Contact,
        route: Route,
        mut control: watch::Receiver<ConnectionControl>,
    ) -> anyhow::Result<Connection> {
        let port = match target.port() {
            Some(port) => port,
            None => bail!("{} has no network address", target),
        };
        let carrier = registry.choose(&route.carrier_name)?;
        if !carrier.can_offer() {
            bail!("carrier {} cannot initiate connections", carrier.name());
        }

        let timeout = control.borrow().timeout;
        let stream = interruptible(TcpStream::connect((target.host(), port)), timeout, &mut control).await??;
        debug!("connected to {:?} for {}", stream.peer_addr().ok(), route);

        Self::initiate(carrier, Box::new(IoStream::tcp(stream)), route, control).await
    }

    /// runs the originating side of the handshake on an established stream
    pub async fn initiate(
        mut carrier: Box<dyn Carrier>,
        stream: Box<dyn TwoWayStream>,
        route: Route,
        control: watch::Receiver<ConnectionControl>,
    ) -> anyhow::Result<Connection> {
        let mut state = ConnectionState::new(stream, route, control);
        carrier.prepare_send(&mut state).await?;
        carrier.send_header(&mut state).await?;
        carrier.expect_reply_to_header(&mut state).await?;
        trace!("handshake complete for {}", state.route());

        Ok(Connection { carrier, state })
    }

    /// Runs the receiving side of the handshake: the first eight bytes select the carrier.
    pub async fn accept(
        registry: &CarrierRegistry,
        stream: Box<dyn TwoWayStream>,
        own_name: &str,
        control: watch::Receiver<ConnectionControl>,
    ) -> anyhow::Result<Connection> {
        let mut state = ConnectionState::new(stream, Route::default(), control);

        let mut raw_header = [0u8; 8];
        state.read_exact(&mut raw_header).await?;
        let mut carrier = registry.choose_by_header(&Header(raw_header))?;
        if !carrier.can_accept() {
            bail!("carrier {} cannot accept connections", carrier.name());
        }

        let sender_name = carrier.expect_sender_specifier(&mut state).await?;
        state.set_route(Route::new(&sender_name, own_name, carrier.name()));
        carrier.expect_extra_header(&mut state).await?;
        carrier.respond_to_header(&mut state).await?;
        debug!("accepted connection {}", state.route());

        Ok(Connection { carrier, state })
    }

    pub fn route(&self) -> &Route {
        self.state.route()
    }

    pub fn carrier(&self) -> &dyn Carrier {
        self.carrier.as_ref()
    }

    /// Sends one message. If the writer has a reply handler, the reply is read and handed to it.
    pub async fn send(&mut self, writer: &mut BufferedConnectionWriter, mut flags: MessageFlags) -> anyhow::Result<()> {
        flags.reply_expected = writer.has_reply_handler();
        if flags.reply_expected && (!self.carrier.support_reply() || self.carrier.is_connectionless()) {
            bail!("carrier {} does not support replies", self.carrier.name());
        }

        if self.carrier.modifies_outgoing_data() {
            self.carrier.modify_outgoing_data(writer)?;
        }
        if writer.is_drop_requested() {
            trace!("dropping message on {}", self.state.route());
            return Ok(());
        }

        self.carrier.write(&mut self.state, writer, flags).await?;
        if self.carrier.require_ack() {
            self.carrier.expect_ack(&mut self.state).await?;
        }

        if flags.admin && !flags.reply_expected && self.carrier.is_text_mode() {
            // admin commands are always answered in text mode
            let discarded = self.carrier.expect_reply(&mut self.state).await?;
            trace!("discarding admin reply of {} bytes on {}", discarded.size(), self.state.route());
        }

        if flags.reply_expected {
            let mut reply = self.carrier.expect_reply(&mut self.state).await?;
            if self.carrier.modifies_incoming_data() {
                reply = self.carrier.modify_incoming_data(reply)?;
            }
            if let Some(handler) = writer.take_reply_handler() {
                if handler.send(reply).is_err() {
                    trace!("reply on {} arrived after its receiver was dropped", self.state.route());
                }
            }
        }
        Ok(())
    }

    /// Receives the next message, acking it if the carrier requires that. Returns `None` when
    ///  the peer ends the connection.
    pub async fn receive(&mut self) -> anyhow::Result<Option<(MessageFlags, ConnectionReader)>> {
        let (flags, mut reader) = match self.carrier.expect_index(&mut self.state).await? {
            Some(x) => x,
            None => return Ok(None),
        };

        if self.carrier.modifies_incoming_data() {
            reader = self.carrier.modify_incoming_data(reader)?;
        }
        if flags.reply_expected && self.carrier.support_reply() {
            reader = reader.with_reply_writer();
        }
        if self.carrier.require_ack() {
            self.carrier.send_ack(&mut self.state).await?;
        }
        Ok(Some((flags, reader)))
    }

    pub async fn reply(&mut self, writer: &mut BufferedConnectionWriter) -> anyhow::Result<()> {
        if self.carrier.modifies_reply() {
            self.carrier.modify_reply(writer)?;
        }
        self.carrier.write_reply(&mut self.state, writer).await
    }

    /// ends the connection from the originating side
    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.carrier.close(&mut self.state).await
    }
}
