//! Connection pumps.
//!
//! Every joined participant gets two tasks. The receive loop turns inbound
//! frames into envelopes for the group; the send loop drains the member's
//! outbound queue onto the wire. Each owns one half of the transport and
//! they share nothing: the group closing the outbound queue is the only
//! signal that ever passes between them.

use crate::group::GroupHandle;
use crate::id::{MemberKey, MemberTag};
use crate::message::Envelope;
use groupcast_transport::{FrameReader, FrameWriter, Transport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// The two tasks serving one member.
#[derive(Debug)]
pub struct PumpTasks {
    /// Inbound loop.
    pub receive: JoinHandle<()>,
    /// Outbound loop.
    pub send: JoinHandle<()>,
}

impl PumpTasks {
    /// Wait for both loops to finish.
    pub async fn wait(self) {
        let (receive, send) = tokio::join!(self.receive, self.send);
        for result in [receive, send] {
            if let Err(e) = result {
                warn!(error = %e, "Pump task failed");
            }
        }
    }
}

/// Start both loops for a member that has already been admitted to `group`.
pub(crate) fn spawn<T: Transport>(
    key: MemberKey,
    tag: MemberTag,
    group: GroupHandle,
    transport: T,
    outbound: mpsc::Receiver<Arc<Envelope>>,
) -> PumpTasks {
    let transport_name = transport.name();
    let (reader, writer) = transport.split();

    debug!(group = %group.id(), member = %tag, transport = transport_name, "Pump started");

    PumpTasks {
        send: tokio::spawn(send_loop(writer, tag.clone(), outbound)),
        receive: tokio::spawn(receive_loop(reader, key, tag, group)),
    }
}

/// Read frames and submit them to the group until the connection ends.
///
/// On exit the member always asks the group to remove it, whatever ended
/// the loop.
async fn receive_loop<R: FrameReader>(
    mut reader: R,
    key: MemberKey,
    tag: MemberTag,
    group: GroupHandle,
) {
    loop {
        match reader.read_frame().await {
            Ok(body) => {
                let envelope = Envelope::new(key, tag.clone(), body);
                trace!(group = %group.id(), member = %tag, message = envelope.id, "Inbound");
                if !group.broadcast(envelope).await {
                    debug!(group = %group.id(), member = %tag, "Broadcast path closed");
                    break;
                }
            }
            Err(e) if e.is_expected_close() => {
                debug!(group = %group.id(), member = %tag, reason = %e, "Disconnected");
                break;
            }
            Err(e) => {
                warn!(group = %group.id(), member = %tag, error = %e, "Transport error");
                break;
            }
        }
    }

    if !group.leave(key).await {
        trace!(group = %group.id(), member = %tag, "Group already gone");
    }
    drop(reader);
    debug!(group = %group.id(), member = %tag, "Receive loop finished");
}

/// Write queued envelopes until the group closes the queue or a write fails.
async fn send_loop<W: FrameWriter>(
    mut writer: W,
    tag: MemberTag,
    mut outbound: mpsc::Receiver<Arc<Envelope>>,
) {
    while let Some(envelope) = outbound.recv().await {
        if let Err(e) = writer.write_frame(envelope.to_text()).await {
            debug!(member = %tag, error = %e, "Write failed");
            break;
        }
    }

    if let Err(e) = writer.close().await {
        trace!(member = %tag, error = %e, "Close failed");
    }
    debug!(member = %tag, "Send loop finished");
}
