pub mod admin;
pub mod config;
pub mod incoming;
pub mod manager;
pub mod packet;
pub mod state;
pub mod unit;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::carrier::MessageFlags;
use crate::connection::protocol::Connection;
use crate::connection::reader::ConnectionReader;
use crate::connection::state::{interruptible, ConnectionControl};
use crate::connection::stream::IoStream;
use crate::connection::writer::BufferedConnectionWriter;
use crate::contact::{Contact, Route};
use crate::context::NetworkContext;
use crate::payload::bottle::{Bottle, Value};
use crate::payload::{PortReader, PortWriter, RawMessage};
use crate::port::config::PortConfig;
use crate::port::incoming::{Incoming, ReadHandler};
use crate::port::manager::{report_event, ManagerCommand, PortManager, UnitTable};
use crate::port::packet::{CompletionCallback, Packet, SendMode};
use crate::port::state::{AtomicPortState, PortState};
use crate::port::unit::{InboundDispatch, LogKind, SendJob};


/// A port's connections as seen from outside
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PortReport {
    pub address: Option<Contact>,
    pub inputs: Vec<Route>,
    pub outputs: Vec<Route>,
}

#[derive(Default)]
struct PortTasks {
    listener: Option<TcpListener>,
    acceptor: Option<JoinHandle<()>>,
    manager: Option<JoinHandle<()>>,
}

/// The shared state behind a [Port], referenced by the port's connection tasks.
pub struct PortCore {
    context: Arc<NetworkContext>,
    config: PortConfig,
    state: AtomicPortState,
    address: ArcSwapOption<Contact>,
    registered: AtomicBool,

    control: watch::Sender<ConnectionControl>,
    units: Arc<ArcSwap<UnitTable>>,
    manager: ArcSwapOption<mpsc::Sender<ManagerCommand>>,
    tasks: Mutex<PortTasks>,

    read_handler: ArcSwap<Option<Arc<dyn ReadHandler>>>,
    inbox_tx: mpsc::Sender<Incoming>,
    inbox_rx: Mutex<mpsc::Receiver<Incoming>>,

    envelope: ArcSwap<Option<Arc<str>>>,
    last_packet: ArcSwapOption<Packet>,
    verbosity: Arc<AtomicU8>,
    properties: ArcSwap<FxHashMap<String, Value>>,
}

impl PortCore {
    fn new(context: Arc<NetworkContext>, config: PortConfig) -> PortCore {
        let (control, _) = watch::channel(ConnectionControl::new(config.timeout.or(context.default_timeout())));
        let (inbox_tx, inbox_rx) = mpsc::channel(config.input_queue_len.max(1));

        PortCore {
            context,
            config,
            state: AtomicPortState::new(),
            address: ArcSwapOption::empty(),
            registered: AtomicBool::new(false),
            control,
            units: Arc::new(ArcSwap::from_pointee(UnitTable::default())),
            manager: ArcSwapOption::empty(),
            tasks: Mutex::new(PortTasks::default()),
            read_handler: ArcSwap::from_pointee(None),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            envelope: ArcSwap::from_pointee(None),
            last_packet: ArcSwapOption::empty(),
            verbosity: Arc::new(AtomicU8::new(0)),
            properties: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }

    pub fn name(&self) -> String {
        self.address.load()
            .as_ref()
            .map(|a| a.name().to_string())
            .unwrap_or_default()
    }

    pub fn address(&self) -> Option<Contact> {
        self.address.load_full().map(|a| Contact::clone(&a))
    }

    pub fn state(&self) -> PortState {
        self.state.get()
    }

    fn check_open(&self) -> anyhow::Result<()> {
        let state = self.state.get();
        if !state.is_open() {
            bail!("port {} is not open ({:?})", self.name(), state);
        }
        Ok(())
    }

    pub fn is_interrupted(&self) -> bool {
        self.control.borrow().interrupted
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.control.borrow().timeout
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.control.send_modify(|c| c.timeout = timeout);
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity.load(Ordering::Relaxed)
    }

    pub fn set_verbosity(&self, verbosity: u8) {
        self.verbosity.store(verbosity, Ordering::Relaxed);
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        self.properties.load().get(key).cloned()
    }

    pub fn properties(&self) -> Vec<(String, Value)> {
        let mut result: Vec<(String, Value)> = self.properties.load().iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }

    pub fn set_property(&self, key: &str, value: Value) {
        self.properties.rcu(|properties| {
            let mut properties = FxHashMap::clone(properties);
            properties.insert(key.to_string(), value.clone());
            Arc::new(properties)
        });
    }

    pub fn units(&self) -> Arc<UnitTable> {
        self.units.load_full()
    }

    async fn manager_command(&self, command: ManagerCommand) -> anyhow::Result<()> {
        let manager = self.manager.load_full()
            .ok_or_else(|| anyhow!("port {} is not listening", self.name()))?;
        manager.send(command).await
            .map_err(|_| anyhow!("port {} is closing", self.name()))
    }

    async fn manager_request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> anyhow::Result<T> {
        let manager = self.manager.load_full()
            .ok_or_else(|| anyhow!("port {} is not listening", self.name()))?;
        let (tx, rx) = oneshot::channel();
        manager.send(command(tx)).await
            .map_err(|_| anyhow!("port {} is closing", self.name()))?;
        rx.await.map_err(|_| anyhow!("port {} is closing", self.name()))
    }

    async fn bind(self: &Arc<Self>, contact: &Contact) -> anyhow::Result<()> {
        let host = if contact.host().is_empty() { self.context.host() } else { contact.host() };
        let listener = TcpListener::bind((host, contact.port().unwrap_or(0))).await
            .with_context(|| format!("binding port {} to {}", contact.name(), host))?;
        let local_addr = listener.local_addr()?;

        let name = if contact.name().is_empty() {
            anonymous_name(&self.context)
        }
        else {
            contact.name().to_string()
        };
        let carrier = if contact.carrier().is_empty() { self.config.carrier.as_str() } else { contact.carrier() };
        let address = Contact::new(&name, carrier, host, local_addr.port());
        debug!("port {} listening at {}", name, local_addr);
        self.address.store(Some(Arc::new(address)));

        let (manager_tx, manager_rx) = mpsc::channel(32);
        let manager = PortManager::new(
            name,
            manager_rx,
            self.units.clone(),
            self.clone(),
            self.config.gc_interval,
            self.verbosity.clone(),
        );
        self.manager.store(Some(Arc::new(manager_tx)));

        let mut tasks = self.tasks.lock().await;
        tasks.listener = Some(listener);
        tasks.manager = Some(tokio::spawn(manager.run()));
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    warn!("error accepting connection on {}: {}", self.name(), e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            trace!("{}: incoming connection from {:?}", self.name(), peer_addr);

            let core = self.clone();
            tokio::spawn(async move {
                let own_name = core.name();
                let handshake = Connection::accept(
                    core.context.carriers(),
                    Box::new(IoStream::tcp(stream)),
                    &own_name,
                    core.control.subscribe(),
                );
                match tokio::time::timeout(core.config.handshake_timeout, handshake).await {
                    Ok(Ok(connection)) => {
                        if core.manager_command(ManagerCommand::AddInput { connection }).await.is_err() {
                            trace!("{}: discarding connection from {:?} while closing", own_name, peer_addr);
                        }
                    }
                    Ok(Err(e)) => debug!("{}: handshake with {:?} failed: {}", own_name, peer_addr, e),
                    Err(_) => debug!("{}: handshake with {:?} timed out", own_name, peer_addr),
                }
            });
        }
    }

    /// Opens an output connection to `target`, which is a port name or an address. The carrier
    ///  is `carrier` if given, else the target's, else the port's default.
    pub async fn add_output(&self, target: &str, carrier: Option<&str>) -> anyhow::Result<Route> {
        self.check_open()?;
        if !self.config.flags.output {
            bail!("port {} does not have outputs", self.name());
        }

        let parsed = Contact::parse(target)?;
        let contact = if parsed.is_valid() {
            parsed
        }
        else {
            let resolved = crate::network::resolve(&self.context, parsed.name()).await?;
            if parsed.carrier().is_empty() { resolved } else { resolved.with_carrier(parsed.carrier()) }
        };
        let target_name = if contact.name().is_empty() { target } else { contact.name() };

        let carrier_name = carrier
            .or(Some(contact.carrier()).filter(|c| !c.is_empty()))
            .unwrap_or(&self.config.carrier)
            .to_string();

        let units = self.units();
        let existing = units.outputs.iter()
            .find(|u| !u.is_finished() && u.route().to_name == target_name);
        if let Some(existing) = existing {
            if existing.route().carrier_name == carrier_name {
                debug!("{}: connection to {} already present", self.name(), target_name);
                return Ok(existing.route().clone());
            }
            bail!("port {} is already connected to {} via {}", self.name(), target_name, existing.route().carrier_name);
        }
        if self.config.flags.rpc && units.outputs.iter().any(|u| !u.is_finished() && u.log_kind().is_none()) {
            bail!("RPC port {} already has an output connection", self.name());
        }

        let route = Route::new(&self.name(), target_name, &carrier_name);
        let connection = Connection::connect(self.context.carriers(), &contact, route, self.control.subscribe()).await?;
        let unit = self.manager_request(|done| ManagerCommand::AddOutput { connection, done }).await?;
        Ok(unit.route().clone())
    }

    /// Stops all connections to or from the named port, returning their number.
    pub async fn remove_connections_with(&self, peer_name: &str) -> anyhow::Result<usize> {
        let peer_name = peer_name.to_string();
        self.manager_request(|done| ManagerCommand::Remove { peer_name, done }).await
    }

    pub async fn send(&self, payload: Arc<dyn PortWriter>, reply: Option<&mut dyn PortReader>, on_completion: Option<CompletionCallback>) -> anyhow::Result<()> {
        self.check_open()?;
        if self.is_interrupted() {
            bail!("port {} is interrupted", self.name());
        }

        let mut control = self.control.subscribe();
        let timeout = self.timeout();

        if self.config.wait_before_send {
            if let Some(previous) = self.last_packet.load_full() {
                interruptible(previous.wait(), timeout, &mut control).await?;
            }
        }

        let units = self.units();
        let targets: Vec<_> = units.outputs.iter()
            .filter(|u| u.log_kind().is_none() && !u.is_finished())
            .collect();

        let reply_target = match &reply {
            Some(_) => match targets.iter().position(|u| u.supports_reply()) {
                Some(idx) => Some(idx),
                None => bail!("port {} has no connection that supports replies", self.name()),
            },
            None => None,
        };

        let (packet, refs) = Packet::start(self.context.next_sequence(), SendMode::Normal, targets.len(), on_completion);
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut reply_tx = Some(reply_tx);
        let envelope: Option<Arc<str>> = (**self.envelope.load()).clone();

        for (idx, (unit, packet_ref)) in targets.iter().zip(refs).enumerate() {
            unit.submit(SendJob {
                payload: payload.clone(),
                packet: packet_ref,
                admin: self.config.admin_mode,
                envelope: envelope.clone(),
                reply: if reply_target == Some(idx) { reply_tx.take() } else { None },
                droppable: false,
            });
        }
        drop(reply_tx);
        self.send_log_copies(&units, LogKind::Out, payload);
        self.last_packet.store(Some(packet.clone()));

        if let Some(reply) = reply {
            let mut reply_reader = interruptible(reply_rx, timeout, &mut control).await?
                .map_err(|_| anyhow!("the connection closed before a reply arrived"))?;
            reply.read(&mut reply_reader)?;
        }
        if self.config.wait_after_send {
            interruptible(packet.wait(), timeout, &mut control).await?;
        }
        Ok(())
    }

    fn send_log_copies(&self, units: &UnitTable, kind: LogKind, payload: Arc<dyn PortWriter>) {
        let loggers: Vec<_> = units.outputs.iter()
            .filter(|u| u.log_kind() == Some(kind) && !u.is_finished())
            .collect();
        if loggers.is_empty() {
            return;
        }

        let (_, refs) = Packet::start(self.context.next_sequence(), SendMode::Log, loggers.len(), None);
        for (unit, packet_ref) in loggers.into_iter().zip(refs) {
            unit.submit(SendJob {
                payload: payload.clone(),
                packet: packet_ref,
                admin: false,
                envelope: None,
                reply: None,
                droppable: true,
            });
        }
    }

    /// is any output connection still transmitting?
    pub fn is_writing(&self) -> bool {
        self.units().outputs.iter().any(|u| u.is_busy())
    }

    pub fn describe(&self) -> PortReport {
        let units = self.units();
        PortReport {
            address: self.address(),
            inputs: units.inputs.iter().filter(|u| !u.is_finished()).map(|u| u.route().clone()).collect(),
            outputs: units.outputs.iter().filter(|u| !u.is_finished()).map(|u| u.route().clone()).collect(),
        }
    }

    async fn close(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.state.transition(&[PortState::Listening, PortState::Starting, PortState::Running], PortState::Finishing).is_err() {
            return Ok(());
        }
        let name = self.name();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        if let Some(acceptor) = &tasks.acceptor {
            acceptor.abort();
        }
        drop(tasks.listener);

        if self.registered.swap(false, Ordering::AcqRel) {
            if let Some(address) = self.address() {
                if let Err(e) = self.context.namespace().unregister_contact(&address).await {
                    warn!("failed to unregister {}: {}", name, e);
                }
            }
        }

        self.state.set(PortState::Closing);
        if let Some(manager) = self.manager.swap(None) {
            let (done_tx, done_rx) = oneshot::channel();
            if manager.send(ManagerCommand::Close { done: done_tx }).await.is_ok() {
                let _ = done_rx.await;
            }
        }
        if let Some(manager_task) = tasks.manager {
            let _ = manager_task.await;
        }

        // wakes up blocked reads and sends
        self.control.send_modify(|c| c.closing = true);
        self.state.set(PortState::Finished);
        report_event(&self.verbosity, format_args!("closed port {}", name));
        Ok(())
    }
}

fn anonymous_name(context: &NetworkContext) -> String {
    format!("/tmp/port/{}", context.next_sequence())
}

#[async_trait]
impl InboundDispatch for PortCore {
    async fn dispatch(&self, flags: MessageFlags, mut reader: ConnectionReader) -> Option<BufferedConnectionWriter> {
        if flags.admin {
            let reply = self.admin_block(&mut reader).await;
            let mut writer = reader.take_reply_writer()?;
            if let Err(e) = reply.write(&mut writer) {
                warn!("failed to write admin reply: {}", e);
            }
            return Some(writer);
        }

        if !self.config.flags.input {
            debug!("{} is not an input port, ignoring message from {}", self.name(), reader.route().from_name);
            return reader.take_reply_writer();
        }

        let units = self.units();
        if units.outputs.iter().any(|u| u.log_kind() == Some(LogKind::In)) {
            let copy = RawMessage { data: reader.unread(), text_mode: reader.is_text_mode() };
            self.send_log_copies(&units, LogKind::In, Arc::new(copy));
        }

        if self.is_interrupted() {
            trace!("{} is interrupted, discarding message from {}", self.name(), reader.route().from_name);
            return reader.take_reply_writer();
        }

        let handler = self.read_handler.load_full();
        if let Some(handler) = &*handler {
            if let Err(e) = handler.on_read(&mut reader).await {
                warn!("read handler of {} failed: {}", self.name(), e);
            }
            return reader.take_reply_writer();
        }

        let text_mode = reader.is_text_mode();
        if reader.is_reply_expected() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self.inbox_tx.send(Incoming::new(reader, Some(reply_tx))).await.is_err() {
                return Some(BufferedConnectionWriter::new(text_mode));
            }
            Some(reply_rx.await.unwrap_or_else(|_| BufferedConnectionWriter::new(text_mode)))
        }
        else {
            let _ = self.inbox_tx.send(Incoming::new(reader, None)).await;
            None
        }
    }
}


/// A named communication endpoint. Messages written to a port go to all of its output
///  connections; messages from its input connections go to its read handler, or are queued for
///  [Port::read].
///
/// Dropping an open port closes it in the background. Call [Port::close] to wait for that.
pub struct Port {
    core: Arc<PortCore>,
}

impl Port {
    pub fn new(context: Arc<NetworkContext>, config: PortConfig) -> Port {
        Port {
            core: Arc::new(PortCore::new(context, config)),
        }
    }

    pub fn core(&self) -> &Arc<PortCore> {
        &self.core
    }

    /// Opens the port under `name` (anonymous if empty): registers the name if the port controls
    ///  its registration, listens on the registered or a free port number, and starts accepting
    ///  connections.
    pub async fn open(&self, name: &str) -> anyhow::Result<()> {
        let core = &self.core;
        let name = if name.is_empty() || name == "..." { anonymous_name(&core.context) } else { name.to_string() };
        let namespace = core.context.namespace();

        let mut contact = Contact::new(&name, &core.config.carrier, core.context.host(), 0);
        if core.config.control_registration && namespace.flags().await.server_allocates_port_numbers {
            let registered = namespace.register_name(&name).await?;
            if let Some(port) = registered.port() {
                contact = contact.with_location(core.context.host(), port);
            }
        }

        self.listen(&contact).await?;

        if core.config.control_registration {
            let address = core.address().ok_or_else(|| anyhow!("port {} has no address", name))?;
            if let Err(e) = namespace.register_contact(&address).await {
                self.close().await?;
                return Err(e.context(format!("registering port {}", name)));
            }
            core.registered.store(true, Ordering::Release);
        }

        self.start().await?;
        report_event(&core.verbosity, format_args!("opened port {}", self.address().map(|a| a.to_uri()).unwrap_or_default()));
        Ok(())
    }

    /// Binds the port to a network address without registering it or accepting connections.
    ///  A port number of 0 picks a free port.
    pub async fn listen(&self, contact: &Contact) -> anyhow::Result<()> {
        self.core.state.transition(&[PortState::Dormant], PortState::Listening)?;
        if let Err(e) = self.core.bind(contact).await {
            self.core.state.set(PortState::Dormant);
            return Err(e);
        }
        Ok(())
    }

    /// starts accepting connections on a listening port
    pub async fn start(&self) -> anyhow::Result<()> {
        self.core.state.transition(&[PortState::Listening], PortState::Starting)?;

        let mut tasks = self.core.tasks.lock().await;
        let listener = match tasks.listener.take() {
            Some(listener) => listener,
            None => {
                self.core.state.set(PortState::Listening);
                bail!("port {} has no listener", self.core.name());
            }
        };
        tasks.acceptor = Some(tokio::spawn(self.core.clone().accept_loop(listener)));
        drop(tasks);

        self.core.state.set(PortState::Running);
        Ok(())
    }

    /// listens on a free port number and starts, without any name registration
    pub async fn manual_start(&self, name: &str) -> anyhow::Result<()> {
        let contact = Contact::new(name, &self.core.config.carrier, self.core.context.host(), 0);
        self.listen(&contact).await?;
        self.start().await
    }

    /// Closes all connections and unregisters the port's name. Blocked reads and sends fail.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.core.close().await
    }

    pub fn set_read_handler(&self, handler: Arc<dyn ReadHandler>) {
        self.core.read_handler.store(Arc::new(Some(handler)));
    }

    /// connects this port's output to `target`, a port name or address
    pub async fn add_output(&self, target: &str) -> anyhow::Result<Route> {
        self.core.add_output(target, None).await
    }

    pub async fn add_output_with_carrier(&self, target: &str, carrier: &str) -> anyhow::Result<Route> {
        self.core.add_output(target, Some(carrier)).await
    }

    /// disconnects from `target`, returning `false` if there was no such connection
    pub async fn remove_output(&self, target: &str) -> anyhow::Result<bool> {
        Ok(self.core.remove_connections_with(target).await? > 0)
    }

    /// Sends a message to all output connections. If `reply` is given, the first connection
    ///  that supports replies is asked for one.
    pub async fn send(&self, payload: Arc<dyn PortWriter>, reply: Option<&mut dyn PortReader>, on_completion: Option<CompletionCallback>) -> anyhow::Result<()> {
        self.core.send(payload, reply, on_completion).await
    }

    pub async fn write<P: PortWriter + Clone + 'static>(&self, payload: &P) -> anyhow::Result<()> {
        self.core.send(Arc::new(payload.clone()), None, None).await
    }

    pub async fn write_with_reply<P: PortWriter + Clone + 'static>(&self, payload: &P, reply: &mut dyn PortReader) -> anyhow::Result<()> {
        self.core.send(Arc::new(payload.clone()), Some(reply), None).await
    }

    /// Waits for the next message. This is for ports without a read handler; it fails when the
    ///  port is interrupted or closed, or when the port's timeout expires.
    pub async fn read(&self) -> anyhow::Result<Incoming> {
        self.core.check_open()?;
        let mut control = self.core.control.subscribe();
        let timeout = self.core.timeout();

        let received = interruptible(async {
            self.core.inbox_rx.lock().await.recv().await
        }, timeout, &mut control).await?;
        received.ok_or_else(|| anyhow!("port {} is closed", self.core.name()))
    }

    /// reads the next message into `payload`, sending an empty reply if one is expected
    pub async fn read_into(&self, payload: &mut dyn PortReader) -> anyhow::Result<bool> {
        self.read().await?.read_into(payload)
    }

    /// Makes blocking operations fail and incoming messages be discarded until [Port::resume].
    pub fn interrupt(&self) {
        debug!("interrupting port {}", self.core.name());
        self.core.control.send_modify(|c| c.interrupted = true);
    }

    pub fn resume(&self) {
        if self.core.state().is_open() {
            self.core.control.send_modify(|c| c.interrupted = false);
        }
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.core.set_timeout(timeout);
    }

    /// Sets a string that is sent along with every following message, for e.g. time stamps.
    pub fn set_envelope(&self, envelope: Option<&str>) {
        self.core.envelope.store(Arc::new(envelope.map(Arc::from)));
    }

    pub fn name(&self) -> String {
        self.core.name()
    }

    pub fn address(&self) -> Option<Contact> {
        self.core.address()
    }

    pub fn state(&self) -> PortState {
        self.core.state()
    }

    pub fn input_count(&self) -> usize {
        self.core.units().inputs.iter().filter(|u| !u.is_finished()).count()
    }

    pub fn output_count(&self) -> usize {
        self.core.units().outputs.iter().filter(|u| !u.is_finished()).count()
    }

    pub fn is_writing(&self) -> bool {
        self.core.is_writing()
    }

    pub fn describe(&self) -> PortReport {
        self.core.describe()
    }

    pub fn set_verbosity(&self, verbosity: u8) {
        self.core.set_verbosity(verbosity);
    }

    /// executes an administrative command as if it was received from a connection
    pub async fn admin_block(&self, command: &Bottle) -> anyhow::Result<Bottle> {
        let mut writer = BufferedConnectionWriter::new(false);
        command.write(&mut writer)?;
        let mut reader = ConnectionReader::new(writer.to_bytes(), false);
        Ok(self.core.admin_block(&mut reader).await)
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if !self.core.state().is_open() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let core = self.core.clone();
            runtime.spawn(async move {
                if let Err(e) = core.close().await {
                    debug!("error closing dropped port: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use rstest::rstest;
    use crate::namespace::local::LocalNameSpace;
    use crate::port::incoming::MockReadHandler;
    use super::*;

    fn context() -> Arc<NetworkContext> {
        Arc::new(NetworkContext::new().with_namespace_backends(vec![Arc::new(LocalNameSpace::new())]))
    }

    /// adds 1 to the last number of a bottle, replying with the sum
    struct Increment {
        received: StdMutex<Vec<Bottle>>,
    }

    #[async_trait]
    impl ReadHandler for Increment {
        async fn on_read(&self, reader: &mut ConnectionReader) -> anyhow::Result<bool> {
            let mut b = Bottle::new();
            b.read(reader)?;
            let n = b.get(b.size().saturating_sub(1)).and_then(|v| v.as_i32()).unwrap_or(0);
            self.received.lock().unwrap().push(b);

            if let Some(writer) = reader.reply_writer() {
                Bottle::from_values(vec![Value::Int32(n + 1)]).write(writer)?;
            }
            Ok(true)
        }
    }

    #[rstest]
    #[case::text("text")]
    #[case::tcp("tcp")]
    #[case::crc("crc")]
    #[tokio::test]
    async fn test_rpc(#[case] carrier: &str) {
        let context = context();
        let server = Port::new(context.clone(), PortConfig::new());
        let handler = Arc::new(Increment { received: StdMutex::new(Vec::new()) });
        server.set_read_handler(handler.clone());
        server.open("/b").await.unwrap();

        let client = Port::new(context.clone(), PortConfig::rpc());
        client.open("/a").await.unwrap();
        client.add_output_with_carrier("/b", carrier).await.unwrap();

        let request = Bottle::from_text("add one 14").unwrap();
        let mut reply = Bottle::new();
        client.write_with_reply(&request, &mut reply).await.unwrap();

        assert_eq!(reply, Bottle::from_text("15").unwrap());
        assert_eq!(*handler.received.lock().unwrap(), vec![request]);

        client.close().await.unwrap();
        server.close().await.unwrap();
        assert_eq!(server.state(), PortState::Finished);
    }

    #[rstest]
    #[case::none(0)]
    #[case::one(1)]
    #[case::five(5)]
    #[tokio::test]
    async fn test_send_to_n_destinations(#[case] n: usize) {
        let context = context();
        let mut receivers = Vec::new();
        for i in 0..n {
            let port = Port::new(context.clone(), PortConfig::new());
            port.open(&format!("/r{}", i)).await.unwrap();
            receivers.push(port);
        }

        let sender = Port::new(context.clone(), PortConfig::new());
        sender.open("/s").await.unwrap();
        for i in 0..n {
            sender.add_output(&format!("/r{}", i)).await.unwrap();
        }
        assert_eq!(sender.output_count(), n);

        let completions = Arc::new(AtomicUsize::new(0));
        let completions_clone = completions.clone();
        let message = Bottle::from_text("hello 1").unwrap();
        sender.send(Arc::new(message.clone()), None, Some(Box::new(move |outcome| {
            assert_eq!(outcome.num_failed, 0);
            completions_clone.fetch_add(1, Ordering::SeqCst);
        }))).await.unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        for r in &receivers {
            let mut received = Bottle::new();
            assert!(r.read_into(&mut received).await.unwrap());
            assert_eq!(received, message);
        }

        sender.close().await.unwrap();
        for r in receivers {
            r.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_interrupt_unblocks_read() {
        let port = Arc::new(Port::new(context(), PortConfig::new()));
        port.open("/idle").await.unwrap();

        let reader = {
            let port = port.clone();
            tokio::spawn(async move { port.read().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        port.interrupt();

        let result = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(result.is_err());

        port.resume();
        assert!(!port.core().is_interrupted());
        port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_keeps_connections() {
        let context = context();
        let receiver = Port::new(context.clone(), PortConfig::new());
        receiver.open("/paused").await.unwrap();
        let sender = Port::new(context.clone(), PortConfig::new());
        sender.open("/pauser").await.unwrap();
        sender.add_output("/paused").await.unwrap();

        receiver.interrupt();
        sender.write(&Bottle::from_text("first").unwrap()).await.unwrap();
        // the ack precedes dispatch, give the discarded message time to reach it
        tokio::time::sleep(Duration::from_millis(50)).await;
        receiver.resume();

        let second = Bottle::from_text("second").unwrap();
        sender.write(&second).await.unwrap();
        let mut received = Bottle::new();
        assert!(receiver.read_into(&mut received).await.unwrap());
        assert_eq!(received, second);

        assert_eq!(sender.output_count(), 1);
        assert_eq!(receiver.input_count(), 1);

        sender.close().await.unwrap();
        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_log_connections() {
        let context = context();
        let spy = Port::new(context.clone(), PortConfig::new());
        spy.open("/spy").await.unwrap();
        let receiver = Port::new(context.clone(), PortConfig::new());
        receiver.open("/observed").await.unwrap();
        let sender = Port::new(context.clone(), PortConfig::new());
        sender.open("/chatty").await.unwrap();

        sender.add_output("/observed").await.unwrap();
        sender.add_output_with_carrier("/spy", "tcp+log.out").await.unwrap();
        receiver.add_output_with_carrier("/spy", "text+log.in").await.unwrap();

        let message = Bottle::from_text("hello 1 2.5").unwrap();
        sender.write(&message).await.unwrap();

        let mut received = Bottle::new();
        assert!(receiver.read_into(&mut received).await.unwrap());
        assert_eq!(received, message);

        // one copy of the sent message, one of the received message converted to text
        for _ in 0..2 {
            let mut copy = Bottle::new();
            assert!(spy.read_into(&mut copy).await.unwrap());
            assert_eq!(copy, message);
        }
        assert_eq!(spy.input_count(), 2);

        sender.close().await.unwrap();
        receiver.close().await.unwrap();
        spy.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_between_ports() {
        let context = context();
        let receiver = Port::new(context.clone(), PortConfig::new());
        receiver.open("/datagrams").await.unwrap();
        let sender = Port::new(context.clone(), PortConfig::new());
        sender.open("/streamer").await.unwrap();

        let route = sender.add_output_with_carrier("/datagrams", "udp").await.unwrap();
        assert_eq!(route.carrier_name, "udp");

        let mut reply = Bottle::new();
        assert!(sender.write_with_reply(&Bottle::from_text("x").unwrap(), &mut reply).await.is_err());

        for i in 0..3 {
            let message = Bottle::from_values(vec![Value::Int32(i)]);
            sender.write(&message).await.unwrap();
            let mut received = Bottle::new();
            assert!(receiver.read_into(&mut received).await.unwrap());
            assert_eq!(received, message);
        }

        sender.close().await.unwrap();
        receiver.close().await.unwrap();
    }

    /// forwards every message's envelope
    struct EnvelopeRecorder {
        envelopes: mpsc::UnboundedSender<Option<String>>,
    }

    #[async_trait]
    impl ReadHandler for EnvelopeRecorder {
        async fn on_read(&self, reader: &mut ConnectionReader) -> anyhow::Result<bool> {
            let _ = self.envelopes.send(reader.envelope().map(|e| e.to_string()));
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_envelope() {
        let context = context();
        let (envelopes_tx, mut envelopes) = mpsc::unbounded_channel();
        let receiver = Port::new(context.clone(), PortConfig::new());
        receiver.set_read_handler(Arc::new(EnvelopeRecorder { envelopes: envelopes_tx }));
        receiver.open("/stamped").await.unwrap();
        let sender = Port::new(context.clone(), PortConfig::new());
        sender.open("/stamper").await.unwrap();
        sender.add_output("/stamped").await.unwrap();

        let message = Bottle::from_text("data").unwrap();
        sender.set_envelope(Some("17 1.25"));
        sender.write(&message).await.unwrap();
        sender.set_envelope(None);
        sender.write(&message).await.unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(tokio::time::timeout(timeout, envelopes.recv()).await.unwrap(), Some(Some("17 1.25".to_string())));
        assert_eq!(tokio::time::timeout(timeout, envelopes.recv()).await.unwrap(), Some(None));

        sender.close().await.unwrap();
        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_destination() {
        let context = context();
        let live = Port::new(context.clone(), PortConfig::new());
        live.open("/live").await.unwrap();
        let dead = Port::new(context.clone(), PortConfig::new());
        dead.open("/dead").await.unwrap();

        let sender = Port::new(context.clone(), PortConfig { gc_interval: Duration::from_millis(20), ..PortConfig::new() });
        sender.open("/fanout").await.unwrap();
        sender.add_output("/live").await.unwrap();
        sender.add_output("/dead").await.unwrap();

        dead.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let num_failed = Arc::new(AtomicUsize::new(usize::MAX));
        let num_failed_clone = num_failed.clone();
        let message = Bottle::from_text("still here").unwrap();
        sender.send(Arc::new(message.clone()), None, Some(Box::new(move |outcome| {
            num_failed_clone.store(outcome.num_failed, Ordering::SeqCst);
        }))).await.unwrap();
        assert_eq!(num_failed.load(Ordering::SeqCst), 1);

        let mut received = Bottle::new();
        assert!(live.read_into(&mut received).await.unwrap());
        assert_eq!(received, message);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sender.output_count(), 1);
        assert_eq!(sender.core().units().outputs.len(), 1);
        assert_eq!(sender.describe().outputs, vec![Route::new("/fanout", "/live", "tcp")]);

        sender.close().await.unwrap();
        live.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let port = Port::new(context(), PortConfig { timeout: Some(Duration::from_millis(20)), ..PortConfig::new() });
        port.open("/slow").await.unwrap();
        assert!(port.read().await.is_err());
        port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_read_with_reply() {
        let context = context();
        let server = Port::new(context.clone(), PortConfig::new());
        server.open("/pull").await.unwrap();
        let client = Port::new(context.clone(), PortConfig::new());
        client.open("/client").await.unwrap();
        client.add_output("/pull").await.unwrap();

        let responder = tokio::spawn(async move {
            let mut incoming = server.read().await.unwrap();
            let mut request = Bottle::new();
            incoming.read_into(&mut request).unwrap();
            assert!(incoming.is_reply_expected());
            incoming.reply(&Bottle::from_text("pong").unwrap()).unwrap();
            server
        });

        let mut reply = Bottle::new();
        client.write_with_reply(&Bottle::from_text("ping").unwrap(), &mut reply).await.unwrap();
        assert_eq!(reply.get(0).and_then(|v| v.as_str()), Some("pong"));

        responder.await.unwrap().close().await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_without_capable_connection_fails() {
        let port = Port::new(context(), PortConfig::new());
        port.open("/lonely").await.unwrap();

        let mut reply = Bottle::new();
        assert!(port.write_with_reply(&Bottle::from_text("x").unwrap(), &mut reply).await.is_err());
        // sending without reply to no one is fine
        port.write(&Bottle::from_text("x").unwrap()).await.unwrap();
        port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_is_called_per_message() {
        let context = context();
        let server = Port::new(context.clone(), PortConfig::new());
        let mut handler = MockReadHandler::new();
        handler.expect_on_read()
            .times(3)
            .returning(|_| Ok(true));
        server.set_read_handler(Arc::new(handler));
        server.open("/mocked").await.unwrap();

        let client = Port::new(context.clone(), PortConfig::new());
        client.open("/mocker").await.unwrap();
        client.add_output("/mocked").await.unwrap();
        for i in 0..3 {
            client.write(&Bottle::from_values(vec![Value::Int32(i)])).await.unwrap();
        }

        // the receiver processes messages asynchronously
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let context = context();
        let port = Port::new(context.clone(), PortConfig::new());
        assert_eq!(port.state(), PortState::Dormant);
        assert!(port.write(&Bottle::new()).await.is_err());

        port.open("/lifecycle").await.unwrap();
        assert_eq!(port.state(), PortState::Running);
        assert!(context.namespace().query_name("/lifecycle").await.unwrap().is_some());
        assert!(port.open("/again").await.is_err());

        port.close().await.unwrap();
        assert_eq!(port.state(), PortState::Finished);
        assert_eq!(context.namespace().query_name("/lifecycle").await.unwrap(), None);
        port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_by_address_and_describe() {
        let context = context();
        let target = Port::new(context.clone(), PortConfig { control_registration: false, ..PortConfig::new() });
        target.manual_start("/unlisted").await.unwrap();
        let address = target.address().unwrap();

        let source = Port::new(context.clone(), PortConfig::new());
        source.open("/source").await.unwrap();
        let route = source.add_output(&address.to_uri()).await.unwrap();
        assert_eq!(route, Route::new("/source", "/unlisted", "tcp"));

        // a second identical connection is not added
        source.add_output(&address.to_uri()).await.unwrap();
        assert_eq!(source.describe().outputs, vec![route.clone()]);

        assert!(source.remove_output("/unlisted").await.unwrap());
        assert!(!source.remove_output("/unlisted").await.unwrap());
        assert_eq!(source.output_count(), 0);

        source.close().await.unwrap();
        target.close().await.unwrap();
    }
}
