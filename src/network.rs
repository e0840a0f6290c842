//! One-off operations that do not need a port of their own: requests to a port, and
//!  administrative commands that connect or disconnect ports.

use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::carrier::registry::CarrierRegistry;
use crate::carrier::MessageFlags;
use crate::connection::protocol::Connection;
use crate::connection::state::ConnectionControl;
use crate::connection::writer::BufferedConnectionWriter;
use crate::contact::{Contact, Route};
use crate::context::NetworkContext;
use crate::payload::bottle::Bottle;
use crate::payload::{PortReader, PortWriter};
use crate::util::vocab::vocabs;


/// the route name used by connections that do not belong to a port
pub const ANONYMOUS_NAME: &str = "/anonymous";

/// Sends one message to a port and reads the reply, over a connection that exists only for
///  this request. The target's carrier is used, `tcp` if it has none.
pub async fn request(
    carriers: &CarrierRegistry,
    target: &Contact,
    payload: &dyn PortWriter,
    reply: &mut dyn PortReader,
    admin: bool,
    timeout: Option<Duration>,
) -> anyhow::Result<bool> {
    let carrier_name = if target.carrier().is_empty() { "tcp" } else { target.carrier() };
    let route = Route::new(ANONYMOUS_NAME, target.name(), carrier_name);
    let (_control_tx, control) = watch::channel(ConnectionControl::new(timeout));

    let mut connection = Connection::connect(carriers, target, route, control).await?;

    let mut writer = BufferedConnectionWriter::new(connection.carrier().is_text_mode());
    payload.write(&mut writer)?;
    let (reply_tx, reply_rx) = oneshot::channel();
    writer.set_reply_handler(reply_tx);

    let result = connection.send(&mut writer, MessageFlags { admin, ..Default::default() }).await;
    if let Err(e) = connection.close().await {
        debug!("error closing request connection to {}: {}", target, e);
    }
    result?;

    let mut reply_reader = reply_rx.await
        .map_err(|_| anyhow!("no reply from {}", target))?;
    reply.read(&mut reply_reader)
}

/// resolves a name, failing if it is not registered
pub async fn resolve(context: &NetworkContext, name: &str) -> anyhow::Result<Contact> {
    match context.namespace().query_name(name).await? {
        Some(contact) if contact.is_valid() => Ok(contact),
        _ => bail!("no address registered for {}", name),
    }
}

/// Sends a message to a named port and returns its reply.
pub async fn write(context: &NetworkContext, target_name: &str, payload: &dyn PortWriter, reply: &mut dyn PortReader) -> anyhow::Result<bool> {
    let target = resolve(context, target_name).await?;
    request(context.carriers(), &target, payload, reply, false, context.default_timeout()).await
}

/// sends an administrative command to a named port and returns its reply
pub async fn admin(context: &NetworkContext, port_name: &str, command: &Bottle) -> anyhow::Result<Bottle> {
    let target = resolve(context, port_name).await?;
    let mut reply = Bottle::new();
    request(context.carriers(), &target, command, &mut reply, true, context.default_timeout()).await?;
    Ok(reply)
}

fn check_admin_reply(reply: &Bottle) -> anyhow::Result<()> {
    // text mode peers may answer `ok` rather than `[ok]`
    match reply.get(0).and_then(|v| v.as_text()) {
        Some(v) if v == vocabs::OK.as_string() => Ok(()),
        _ => bail!("command failed: {}", reply),
    }
}

/// Asks the port `source` to open an output connection to the port `target`.
pub async fn connect(context: &NetworkContext, source: &str, target: &str, carrier: Option<&str>) -> anyhow::Result<()> {
    let mut command = Bottle::new();
    command.add_vocab(vocabs::ADD);
    command.add_string(target);
    if let Some(carrier) = carrier {
        command.add_string(carrier);
    }
    check_admin_reply(&admin(context, source, &command).await?)
}

/// Asks the port `source` to remove its connection to `target`.
pub async fn disconnect(context: &NetworkContext, source: &str, target: &str) -> anyhow::Result<()> {
    let mut command = Bottle::new();
    command.add_vocab(vocabs::DEL);
    command.add_string(target);
    check_admin_reply(&admin(context, source, &command).await?)
}
