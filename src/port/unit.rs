use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn, Instrument};

use crate::carrier::MessageFlags;
use crate::connection::protocol::Connection;
use crate::connection::reader::ConnectionReader;
use crate::connection::writer::{BufferedConnectionWriter, ReplyHandler};
use crate::contact::Route;
use crate::payload::PortWriter;
use crate::port::packet::PacketRef;


/// Identifies a connection unit of a port. Ids are reused after a unit is removed, with a new
///  generation so that a stale id never refers to its slot's new occupant.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct UnitId {
    index: u32,
    generation: u32,
}

impl Display for UnitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

pub struct UnitArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> UnitArena<T> {
    pub fn new() -> UnitArena<T> {
        UnitArena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// the id that the next [UnitArena::insert] will assign
    pub fn next_id(&self) -> UnitId {
        match self.free.last() {
            Some(&index) => UnitId { index, generation: self.slots[index as usize].generation },
            None => UnitId { index: self.slots.len() as u32, generation: 0 },
        }
    }

    pub fn insert(&mut self, entry: T) -> UnitId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, entry: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        UnitId { index, generation: slot.generation }
    }

    pub fn get(&self, id: UnitId) -> Option<&T> {
        self.slots.get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_ref())
    }

    pub fn remove(&mut self, id: UnitId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = (UnitId, &T)> {
        self.slots.iter()
            .enumerate()
            .filter_map(|(index, s)| s.entry.as_ref()
                .map(|e| (UnitId { index: index as u32, generation: s.generation }, e)))
    }

    pub fn ids(&self) -> Vec<UnitId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for UnitArena<T> {
    fn default() -> Self {
        UnitArena::new()
    }
}


/// Output connections that receive copies of a port's traffic rather than its regular messages
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LogKind {
    /// copies of all messages the port sends
    Out,
    /// copies of all messages the port receives
    In,
}

impl LogKind {
    /// derives the log kind from a carrier name's modifiers, e.g. `tcp+log.in`
    pub fn from_carrier_name(carrier_name: &str) -> Option<LogKind> {
        let mut result = None;
        for modifier in carrier_name.split('+').skip(1) {
            match modifier {
                "log.out" => result = Some(LogKind::Out),
                "log.in" => result = Some(LogKind::In),
                _ => {}
            }
        }
        result
    }
}

/// one message queued for an output unit
pub struct SendJob {
    pub payload: Arc<dyn PortWriter>,
    pub packet: PacketRef,
    pub admin: bool,
    pub envelope: Option<Arc<str>>,
    pub reply: Option<ReplyHandler>,
    /// may be skipped if more messages are queued behind it
    pub droppable: bool,
}

/// The shared view of an outgoing connection. The connection itself is owned by the unit's
///  worker task; senders interact with it only by queueing [SendJob]s.
pub struct OutputUnit {
    id: UnitId,
    route: Route,
    log_kind: Option<LogKind>,
    supports_reply: bool,
    connectionless: bool,
    jobs: mpsc::UnboundedSender<SendJob>,
    pending: AtomicUsize,
    busy: AtomicBool,
    finished: AtomicBool,
}

impl OutputUnit {
    pub fn new(id: UnitId, connection: &Connection, jobs: mpsc::UnboundedSender<SendJob>) -> OutputUnit {
        let route = connection.route().clone();
        OutputUnit {
            id,
            log_kind: LogKind::from_carrier_name(&route.carrier_name),
            route,
            supports_reply: connection.carrier().support_reply(),
            connectionless: connection.carrier().is_connectionless(),
            jobs,
            pending: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn log_kind(&self) -> Option<LogKind> {
        self.log_kind
    }

    /// replies can be requested through this connection
    pub fn supports_reply(&self) -> bool {
        self.supports_reply && !self.connectionless
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire) || self.pending.load(Ordering::Acquire) > 0
    }

    /// Queues a job. If the unit's worker is gone, the job is dropped, which completes its share
    ///  of the packet as failed.
    pub fn submit(&self, mut job: SendJob) {
        if self.is_finished() {
            job.packet.mark_failed();
            return;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(mut job)) = self.jobs.send(job) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            job.packet.mark_failed();
        }
    }
}

/// the shared view of an incoming connection
pub struct InputUnit {
    id: UnitId,
    route: Route,
    finished: AtomicBool,
}

impl InputUnit {
    pub fn new(id: UnitId, route: Route) -> InputUnit {
        InputUnit {
            id,
            route,
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}


/// Where an input unit hands received messages. The returned writer, if any, is sent back as
///  the reply.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InboundDispatch: Send + Sync + 'static {
    async fn dispatch(&self, flags: MessageFlags, reader: ConnectionReader) -> Option<BufferedConnectionWriter>;
}

pub async fn run_output_unit(
    unit: Arc<OutputUnit>,
    mut connection: Connection,
    mut jobs: mpsc::UnboundedReceiver<SendJob>,
    mut stop: oneshot::Receiver<()>,
) {
    let span = tracing::debug_span!("output", unit = %unit.id(), route = %unit.route());
    async move {
        loop {
            let job = tokio::select! {
                biased;
                _ = &mut stop => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            unit.pending.fetch_sub(1, Ordering::AcqRel);

            unit.busy.store(true, Ordering::Release);
            let result = send_job(&unit, &mut connection, job).await;
            unit.busy.store(false, Ordering::Release);

            if let Err(e) = result {
                warn!("sending failed, closing connection: {}", e);
                break;
            }
        }

        unit.finished.store(true, Ordering::Release);
        // fail the rest of the queue right away rather than when the receiver is dropped
        jobs.close();
        while let Ok(mut job) = jobs.try_recv() {
            unit.pending.fetch_sub(1, Ordering::AcqRel);
            job.packet.mark_failed();
        }

        if let Err(e) = connection.close().await {
            debug!("error closing connection: {}", e);
        }
        debug!("output unit finished");
    }
        .instrument(span)
        .await
}

async fn send_job(unit: &OutputUnit, connection: &mut Connection, job: SendJob) -> anyhow::Result<()> {
    let SendJob { payload, mut packet, admin, envelope, reply, droppable } = job;

    let text_mode = connection.carrier().is_text_mode();
    let mut writer = BufferedConnectionWriter::new(text_mode);
    let mut flags = MessageFlags { admin, ..Default::default() };

    if let Some(envelope) = &envelope {
        if text_mode {
            trace!("envelope is not supported in text mode, skipping it");
        }
        else {
            writer.add_to_header();
            writer.append_string(envelope);
            writer.add_to_body();
            flags.envelope = true;
        }
    }

    if let Err(e) = payload.write(&mut writer) {
        warn!("failed to serialize message for packet #{}: {}", packet.packet().id(), e);
        packet.mark_failed();
        return Ok(());
    }

    if droppable && unit.pending.load(Ordering::Acquire) > 0 {
        writer.request_drop();
    }
    if let Some(reply) = reply {
        writer.set_reply_handler(reply);
    }

    let result = connection.send(&mut writer, flags).await;
    if result.is_err() {
        packet.mark_failed();
    }
    result
}

pub async fn run_input_unit(
    unit: Arc<InputUnit>,
    mut connection: Connection,
    dispatch: Arc<dyn InboundDispatch>,
    mut stop: oneshot::Receiver<()>,
) {
    let span = tracing::debug_span!("input", unit = %unit.id(), route = %unit.route());
    async move {
        let text_mode = connection.carrier().is_text_mode();
        loop {
            let received = tokio::select! {
                biased;
                _ = &mut stop => break,
                received = connection.receive() => received,
            };

            let (flags, reader) = match received {
                Ok(Some(x)) => x,
                Ok(None) => {
                    debug!("connection closed by peer");
                    break;
                }
                Err(e) => {
                    debug!("error receiving: {}", e);
                    break;
                }
            };

            let reply_expected = reader.is_reply_expected();
            let reply = dispatch.dispatch(flags, reader).await;
            let reply = match (reply, reply_expected) {
                (Some(reply), true) => Some(reply),
                // the sender waits, so it gets an empty reply
                (None, true) => Some(BufferedConnectionWriter::new(text_mode)),
                (_, false) => None,
            };

            if let Some(mut reply) = reply {
                if let Err(e) = connection.reply(&mut reply).await {
                    debug!("error sending reply: {}", e);
                    break;
                }
            }
        }

        unit.finished.store(true, Ordering::Release);
        debug!("input unit finished");
    }
        .instrument(span)
        .await
}
