use std::sync::{Arc, Weak};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace};

use crate::{
    Payload, Result,
    framing::FrameDecoder,
    metrics::METRICS,
    packet::UpdatePacket,
    scheduler::{ConnectionHooks, SchedulerEvent, SchedulerOpts, UpdateScheduler},
    traits::Capabilities,
    transport::Transport,
    utils::spawn_with_cancel,
};

/// A transport driven by an update scheduler: outgoing packets on the scheduler's timer,
/// incoming bytes reassembled and fed back into it.
pub struct Connection {
    scheduler: Arc<UpdateScheduler>,
    transport: Arc<Transport>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Connection {
    /// Binds `transport` to a fresh scheduler and starts it. `incoming` is the receiving
    /// end the transport was created with.
    pub fn start(
        transport: Transport,
        incoming: UnboundedReceiver<Payload>,
        opts: SchedulerOpts,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Result<(Self, UnboundedReceiver<SchedulerEvent>)> {
        let cancel = opts.cancellation_token.child_token();
        let parent_span = opts.parent_span.clone();
        let (scheduler, events) = UpdateScheduler::new(
            SchedulerOpts {
                cancellation_token: cancel.clone(),
                ..opts
            },
            hooks,
        )?;
        let transport = Arc::new(transport);
        scheduler.bind_transport(transport.clone())?;

        spawn_with_cancel(
            debug_span!(parent: parent_span, "connection_recv"),
            cancel.clone(),
            recv_loop(Arc::downgrade(&scheduler), incoming, scheduler.mtu()),
        );
        scheduler.start();

        Ok((
            Self {
                scheduler,
                transport,
                cancel,
            },
            events,
        ))
    }

    pub fn scheduler(&self) -> &Arc<UpdateScheduler> {
        &self.scheduler
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn capabilities(&self) -> Capabilities {
        self.transport.capabilities()
    }

    /// Flushes one last packet, then stops the scheduler, the receive loop and the transport.
    pub async fn disconnect(&self) {
        self.scheduler.stop();
        self.scheduler.unbind_transport();
        self.cancel.cancel();
        self.transport.disconnect().await;
        debug!("disconnected");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) async fn recv_loop(
    scheduler: Weak<UpdateScheduler>,
    mut incoming: UnboundedReceiver<Payload>,
    mtu: usize,
) -> Result<()> {
    let mut decoder = FrameDecoder::default();
    while let Some(datagram) = incoming.recv().await {
        let Some(scheduler) = scheduler.upgrade() else {
            return Ok(());
        };
        for frame in decoder.feed(&datagram) {
            match UpdatePacket::deserialize(&frame) {
                Ok(packet) => scheduler.on_receive_packet(packet),
                Err(e) => {
                    METRICS.undecodable_packets.increment(1);
                    debug_every_ms!(1000, "dropping undecodable packet: {e:#}");
                    decoder.reset();
                }
            }
        }
        // Every packet starts on a datagram boundary, so anything shorter than the MTU
        // ends one. Bytes still pending after it mean a fragment went missing.
        if datagram.len() < mtu && decoder.leftover() > 0 {
            trace!(
                leftover = decoder.leftover(),
                "incomplete packet, a fragment was lost"
            );
            METRICS.undecodable_packets.increment(1);
            decoder.reset();
        }
    }
    trace!("transport closed");
    Ok(())
}
