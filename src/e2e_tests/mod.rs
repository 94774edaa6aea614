use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::{
    connection::recv_loop,
    constants::MTU,
    scheduler::{DefaultHooks, SchedulerEvent, SchedulerOpts, UpdateScheduler},
    test_util::{LossyLink, setup_test_logging},
};

const LOSS_PCT: usize = 5;
const ONE_WAY_LATENCY: Duration = Duration::from_millis(30);
const PACKETS: usize = 1000;

struct Peer {
    scheduler: Arc<UpdateScheduler>,
    events: UnboundedReceiver<SchedulerEvent>,
    // What this peer sends goes through here.
    link: Arc<LossyLink<LOSS_PCT>>,
}

fn connected_pair(seed: u64) -> (Peer, Peer) {
    let new = || UpdateScheduler::new(SchedulerOpts::default(), Arc::new(DefaultHooks)).unwrap();
    let (a, a_events) = new();
    let (b, b_events) = new();
    let (ab, ab_rx) = LossyLink::<LOSS_PCT>::new(ONE_WAY_LATENCY, seed);
    let (ba, ba_rx) = LossyLink::<LOSS_PCT>::new(ONE_WAY_LATENCY, seed.wrapping_add(1));
    a.bind_transport(ab.clone()).unwrap();
    b.bind_transport(ba.clone()).unwrap();
    tokio::spawn(recv_loop(Arc::downgrade(&b), ab_rx, MTU));
    tokio::spawn(recv_loop(Arc::downgrade(&a), ba_rx, MTU));
    (
        Peer {
            scheduler: a,
            events: a_events,
            link: ab,
        },
        Peer {
            scheduler: b,
            events: b_events,
            link: ba,
        },
    )
}

#[derive(Default, Debug)]
struct Received {
    timeouts: usize,
    // Reliable payload -> how many times the application saw it.
    reliable: HashMap<Vec<u8>, usize>,
}

fn drain(events: &mut UnboundedReceiver<SchedulerEvent>) -> Received {
    let mut r = Received::default();
    while let Ok(event) = events.try_recv() {
        match event {
            SchedulerEvent::TimedOut => r.timeouts += 1,
            SchedulerEvent::Received(p) => {
                let resent = p.resend.into_iter().flat_map(|b| b.payloads);
                for payload in p.reliable.into_iter().chain(resent) {
                    *r.reliable.entry(payload).or_default() += 1;
                }
            }
        }
    }
    r
}

#[tokio::test(start_paused = true)]
async fn test_lossy_link_exchange() {
    setup_test_logging();
    let (mut a, mut b) = connected_pair(42);
    a.scheduler.start();
    b.scheduler.start();

    let mut pushed = Vec::new();
    let mut rtt_halfway = None;
    let mut i = 0usize;
    while a.link.delivered() + a.link.lost() < PACKETS {
        if i % 10 == 0 {
            let msg = format!("reliable-{i}").into_bytes();
            a.scheduler.push_reliable(msg.clone());
            pushed.push(msg);
        }
        i += 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
        if rtt_halfway.is_none() && a.link.delivered() + a.link.lost() >= PACKETS / 2 {
            rtt_halfway = a.scheduler.average_rtt();
        }
    }
    // Let the last resends go through.
    tokio::time::sleep(Duration::from_secs(3)).await;
    a.scheduler.stop();
    b.scheduler.stop();

    info!(
        lost = a.link.lost(),
        delivered = a.link.delivered(),
        rate = ?a.scheduler.send_rate(),
        "done"
    );
    assert!(a.link.lost() > 10, "the link should have dropped packets");

    let rtt_halfway = rtt_halfway.unwrap();
    let rtt_end = a.scheduler.average_rtt().unwrap();
    // At least the round trip latency, plus the peer's wait until its next send.
    for rtt in [rtt_halfway, rtt_end] {
        assert!((55. ..=200.).contains(&rtt), "rtt {rtt} out of range");
    }
    assert!(
        (rtt_halfway - rtt_end).abs() < 60.,
        "rtt didn't settle: {rtt_halfway} vs {rtt_end}"
    );

    let at_b = drain(&mut b.events);
    let at_a = drain(&mut a.events);
    assert!(at_a.timeouts <= 1);
    assert!(at_b.timeouts <= 1);

    for msg in pushed.iter() {
        assert_eq!(
            at_b.reliable.get(msg).copied(),
            Some(1),
            "{} not delivered exactly once",
            String::from_utf8_lossy(msg)
        );
    }
    assert_eq!(at_b.reliable.len(), pushed.len());
    assert_eq!(a.scheduler.reliable_in_flight(), 0);
}
