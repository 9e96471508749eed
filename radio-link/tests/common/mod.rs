#![allow(dead_code)]

use std::thread::{self, JoinHandle};
use std::time::Duration;

use radio_link::device::sim::{Ether, SimDevice};
use radio_link::{EnumerationParams, Link, LinkConfig, Node, Served, TransferParams};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Windows wide enough for loaded CI machines, short enough to keep tests fast.
pub fn test_config() -> LinkConfig {
    LinkConfig {
        ack_timeout: Duration::from_millis(100),
        turnaround: Duration::from_millis(2),
        transfer: TransferParams {
            settle_delay: Duration::from_millis(10),
            packet_gap: Duration::from_millis(1),
            packet_timeout: Duration::from_millis(60),
            control_timeout: Duration::from_secs(2),
            resend_delay: Duration::from_millis(5),
            ..TransferParams::default()
        },
        enumeration: EnumerationParams {
            repeat: 5,
            response_window: Duration::from_millis(100),
            unack_repeat: 3,
            unack_gap: Duration::from_millis(3),
            backoff_offset: Duration::from_millis(2),
            claim_window: Duration::from_millis(60),
            reclaim: false,
        },
        ..LinkConfig::default()
    }
}

/// Serves the master on its own thread until `count` requests were handled or
/// nothing came for a second.
pub fn spawn_responder(
    ether: &Ether,
    node: Node,
    count: usize,
) -> (usize, JoinHandle<(Link<SimDevice>, Vec<Served>)>) {
    let device = ether.attach();
    let station = device.station();
    let mut link = Link::new(device, node, test_config());
    let handle = thread::spawn(move || {
        let mut served = Vec::new();
        while served.len() < count {
            let master = Node::master(link.node().channel);
            match link.serve(master, Duration::from_secs(1)).unwrap() {
                Some(request) => served.push(request),
                None => break,
            }
        }
        (link, served)
    });
    // Let the responder enter receive mode.
    thread::sleep(Duration::from_millis(50));
    (station, handle)
}
