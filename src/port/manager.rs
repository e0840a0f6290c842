use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::connection::protocol::Connection;
use crate::contact::Route;
use crate::port::unit::{run_input_unit, run_output_unit, InboundDispatch, InputUnit, OutputUnit, UnitArena, UnitId};


/// upper bound for an output unit to finish its current message when the port closes
const OUTPUT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Logs a connection event, at info level if the port's verbosity is raised.
pub fn report_event(verbosity: &AtomicU8, message: std::fmt::Arguments) {
    if verbosity.load(Ordering::Relaxed) > 0 {
        info!("{}", message);
    }
    else {
        debug!("{}", message);
    }
}

/// An immutable snapshot of a port's connection units. Senders work on the snapshot that was
///  current when they started, so units added during a send do not receive that message.
#[derive(Default)]
pub struct UnitTable {
    pub outputs: Vec<Arc<OutputUnit>>,
    pub inputs: Vec<Arc<InputUnit>>,
}

pub enum ManagerCommand {
    AddOutput {
        connection: Connection,
        done: oneshot::Sender<Arc<OutputUnit>>,
    },
    AddInput {
        connection: Connection,
    },
    /// stops all connections to or from the named port, returning their number
    Remove {
        peer_name: String,
        done: oneshot::Sender<usize>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

enum UnitEntry {
    Output {
        unit: Arc<OutputUnit>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    Input {
        unit: Arc<InputUnit>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
}

impl UnitEntry {
    fn is_finished(&self) -> bool {
        match self {
            UnitEntry::Output { unit, .. } => unit.is_finished(),
            UnitEntry::Input { unit, .. } => unit.is_finished(),
        }
    }

    fn route(&self) -> &Route {
        match self {
            UnitEntry::Output { unit, .. } => unit.route(),
            UnitEntry::Input { unit, .. } => unit.route(),
        }
    }

    fn is_connected_to(&self, peer_name: &str) -> bool {
        match self {
            UnitEntry::Output { unit, .. } => unit.route().to_name == peer_name,
            UnitEntry::Input { unit, .. } => unit.route().from_name == peer_name,
        }
    }
}

/// The single owner of a port's connection units. All additions and removals go through its
///  command queue, so they are serialized without locking; senders and introspection read the
///  published [UnitTable] snapshot.
pub struct PortManager {
    port_name: String,
    arena: UnitArena<UnitEntry>,
    commands: mpsc::Receiver<ManagerCommand>,
    table: Arc<ArcSwap<UnitTable>>,
    dispatch: Arc<dyn InboundDispatch>,
    gc_interval: Duration,
    verbosity: Arc<AtomicU8>,
}

impl PortManager {
    pub fn new(
        port_name: String,
        commands: mpsc::Receiver<ManagerCommand>,
        table: Arc<ArcSwap<UnitTable>>,
        dispatch: Arc<dyn InboundDispatch>,
        gc_interval: Duration,
        verbosity: Arc<AtomicU8>,
    ) -> PortManager {
        PortManager {
            port_name,
            arena: UnitArena::new(),
            commands,
            table,
            dispatch,
            gc_interval,
            verbosity,
        }
    }

    pub async fn run(mut self) {
        let mut gc = tokio::time::interval(self.gc_interval);
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ManagerCommand::Close { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = gc.tick() => self.collect_garbage(),
            }
        }
        debug!("manager of port {} finished", self.port_name);
    }

    fn on_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::AddOutput { connection, done } => {
                let unit = self.add_output(connection);
                let _ = done.send(unit);
            }
            ManagerCommand::AddInput { connection } => {
                self.add_input(connection);
            }
            ManagerCommand::Remove { peer_name, done } => {
                let num_removed = self.remove_connections_with(&peer_name);
                let _ = done.send(num_removed);
            }
            ManagerCommand::Close { .. } => {}
        }
    }

    fn add_output(&mut self, connection: Connection) -> Arc<OutputUnit> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let unit = Arc::new(OutputUnit::new(self.arena.next_id(), &connection, jobs_tx));
        let task = tokio::spawn(run_output_unit(unit.clone(), connection, jobs_rx, stop_rx));
        self.arena.insert(UnitEntry::Output { unit: unit.clone(), stop: stop_tx, task });
        self.publish();

        report_event(&self.verbosity, format_args!("{}: added output {}", self.port_name, unit.route()));
        unit
    }

    fn add_input(&mut self, connection: Connection) {
        let (stop_tx, stop_rx) = oneshot::channel();

        let unit = Arc::new(InputUnit::new(self.arena.next_id(), connection.route().clone()));
        let task = tokio::spawn(run_input_unit(unit.clone(), connection, self.dispatch.clone(), stop_rx));
        self.arena.insert(UnitEntry::Input { unit: unit.clone(), stop: stop_tx, task });
        self.publish();

        report_event(&self.verbosity, format_args!("{}: added input {}", self.port_name, unit.route()));
    }

    fn remove_connections_with(&mut self, peer_name: &str) -> usize {
        let ids: Vec<UnitId> = self.arena.iter()
            .filter(|(_, e)| e.is_connected_to(peer_name))
            .map(|(id, _)| id)
            .collect();

        for id in &ids {
            if let Some(entry) = self.arena.remove(*id) {
                report_event(&self.verbosity, format_args!("{}: removing {}", self.port_name, entry.route()));
                // dropping the stop sender ends the unit's task, which closes the connection
                drop(entry);
            }
        }
        if !ids.is_empty() {
            self.publish();
        }
        ids.len()
    }

    fn collect_garbage(&mut self) {
        let finished: Vec<UnitId> = self.arena.iter()
            .filter(|(_, e)| e.is_finished())
            .map(|(id, _)| id)
            .collect();
        if finished.is_empty() {
            return;
        }

        for id in finished {
            if let Some(entry) = self.arena.remove(id) {
                report_event(&self.verbosity, format_args!("{}: connection {} ended", self.port_name, entry.route()));
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let mut table = UnitTable::default();
        for (_, entry) in self.arena.iter() {
            match entry {
                UnitEntry::Output { unit, .. } => table.outputs.push(unit.clone()),
                UnitEntry::Input { unit, .. } => table.inputs.push(unit.clone()),
            }
        }
        trace!("{}: {} outputs, {} inputs", self.port_name, table.outputs.len(), table.inputs.len());
        self.table.store(Arc::new(table));
    }

    /// Stops all units: output units finish the message they are sending (within a time
    ///  limit), input units are aborted.
    async fn shutdown(&mut self) {
        let mut tasks = Vec::new();
        for id in self.arena.ids() {
            match self.arena.remove(id) {
                Some(UnitEntry::Output { stop, task, .. }) => {
                    let _ = stop.send(());
                    tasks.push(task);
                }
                Some(UnitEntry::Input { stop, task, .. }) => {
                    drop(stop);
                    task.abort();
                    tasks.push(task);
                }
                None => {}
            }
        }
        self.publish();

        for mut task in tasks {
            if tokio::time::timeout(OUTPUT_SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                debug!("{}: aborting connection that did not stop in time", self.port_name);
                task.abort();
            }
        }
    }
}
