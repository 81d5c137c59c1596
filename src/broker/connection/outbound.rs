//! Outbound writer task
//!
//! Owns the transport's write half. Control packets (acks, SUBACK, PINGRESP,
//! resends, DISCONNECT) always go before queued application messages.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::broker::sessions::SharedSession;
use crate::broker::transport::PacketWriter;
use crate::broker::writer::SharedWriter;
use crate::hooks::{Hooks, InterceptingOutbound};
use crate::protocol::Packet;
use crate::session::{DeliveryError, Outgoing};

pub(super) async fn run<W: PacketWriter>(
    mut transport: W,
    writer: Arc<SharedWriter>,
    session: SharedSession,
    notify: Arc<Notify>,
    hooks: Arc<dyn Hooks>,
    client_id: Arc<str>,
    max_inflight: usize,
) {
    loop {
        for packet in writer.take_control() {
            let Some(packet) = intercept(&hooks, &client_id, packet).await else {
                continue;
            };
            if let Err(e) = transport.write_packet(packet).await {
                debug!("Write to {} failed: {}", client_id, e);
                writer.close();
                let _ = transport.close().await;
                return;
            }
        }

        if !writer.is_alive() {
            break;
        }

        // Bind first so the session lock is released before awaiting
        let outgoing = session.write().next_outgoing(max_inflight);
        let Some(Outgoing {
            publish,
            completion,
        }) = outgoing
        else {
            tokio::select! {
                _ = writer.notified() => {}
                _ = notify.notified() => {}
            }
            continue;
        };

        let packet_id = publish.packet_id;
        match intercept(&hooks, &client_id, Packet::Publish(publish)).await {
            Some(packet) => {
                if let Err(e) = transport.write_packet(packet).await {
                    // the message stays in flight and is requeued on detach
                    debug!("Write to {} failed: {}", client_id, e);
                    writer.close();
                    break;
                }
                if let Some(tx) = completion {
                    let _ = tx.send(Ok(()));
                }
            }
            None => {
                if let Some(id) = packet_id {
                    session.write().inflight.remove(&id);
                }
                if let Some(tx) = completion {
                    let _ = tx.send(Err(DeliveryError::Discarded));
                }
            }
        }
    }

    let _ = transport.close().await;
}

/// Run the outbound interceptor. `None` drops the packet.
async fn intercept(hooks: &Arc<dyn Hooks>, client_id: &Arc<str>, packet: Packet) -> Option<Packet> {
    let mut ctx = InterceptingOutbound {
        client_id: client_id.clone(),
        packet,
        accept: true,
    };
    if let Err(e) = hooks.intercept_outbound_packet(&mut ctx).await {
        warn!("Outbound interceptor error for {}: {}", client_id, e);
        return Some(ctx.packet);
    }
    if !ctx.accept {
        trace!("Outbound {} to {} dropped by interceptor", ctx.packet.name(), client_id);
        return None;
    }
    Some(ctx.packet)
}
