use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::Instant,
};

use crate::{
    Payload, Result,
    traits::{Capabilities, TransportSender},
};

/// Records every send. The flag says whether it went through `send_reliable`.
pub struct MockSender {
    capabilities: Capabilities,
    sent: Mutex<Vec<(Payload, bool)>>,
}

impl MockSender {
    pub fn new(capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn take_sent(&self) -> Vec<(Payload, bool)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl TransportSender for MockSender {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn send(&self, buf: &[u8]) -> Result<()> {
        self.sent.lock().push((buf.to_vec(), false));
        Ok(())
    }

    fn send_reliable(&self, buf: &[u8]) -> Result<()> {
        self.sent.lock().push((buf.to_vec(), true));
        Ok(())
    }
}

/// One direction of an in-process datagram link that drops `LOSS_PCT` percent of sends
/// and delivers the rest, in order, after a fixed latency.
pub struct LossyLink<const LOSS_PCT: usize> {
    queue: UnboundedSender<(Instant, Payload)>,
    latency: Duration,
    rng: Mutex<StdRng>,
    sent: AtomicUsize,
    lost: AtomicUsize,
}

impl<const LOSS_PCT: usize> LossyLink<LOSS_PCT> {
    /// Must be called within a tokio runtime. Returns the receiving end.
    pub fn new(latency: Duration, seed: u64) -> (Arc<Self>, UnboundedReceiver<Payload>) {
        let (queue_tx, mut queue_rx) = unbounded_channel::<(Instant, Payload)>();
        let (out_tx, out_rx) = unbounded_channel();
        tokio::spawn(async move {
            while let Some((deliver_at, data)) = queue_rx.recv().await {
                tokio::time::sleep_until(deliver_at).await;
                if out_tx.send(data).is_err() {
                    return;
                }
            }
        });
        let link = Arc::new(Self {
            queue: queue_tx,
            latency,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            sent: AtomicUsize::new(0),
            lost: AtomicUsize::new(0),
        });
        (link, out_rx)
    }

    fn loss(&self) -> bool {
        let loss = self.rng.lock().random_bool(LOSS_PCT as f64 / 100.);
        if loss {
            self.lost.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
        loss
    }

    pub fn lost(&self) -> usize {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

impl<const LOSS_PCT: usize> TransportSender for LossyLink<LOSS_PCT> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn send(&self, buf: &[u8]) -> Result<()> {
        if self.loss() {
            return Ok(());
        }
        let _ = self.queue.send((Instant::now() + self.latency, buf.to_vec()));
        Ok(())
    }
}
