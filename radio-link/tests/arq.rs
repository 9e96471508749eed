mod common;

use std::convert::Infallible;
use std::thread;
use std::time::{Duration, Instant};

use common::{init_logger, spawn_responder, test_config};
use embedded_hal::blocking::delay::DelayMs;
use radio_link::device::sim::Ether;
use radio_link::device::Device;
use radio_link::{Command, Link, LinkConfig, LinkError, Node, PhysicalAddress, Served, MAX_RETRIES};

/// Device nobody answers, whose clock only moves when the link waits on it.
struct SilentDevice {
    origin: Instant,
    elapsed: Duration,
    transmissions: usize,
}

impl SilentDevice {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Duration::ZERO,
            transmissions: 0,
        }
    }
}

impl DelayMs<u32> for SilentDevice {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed += Duration::from_millis(ms as u64);
    }
}

impl Device for SilentDevice {
    type Error = Infallible;

    fn payload_size(&self) -> usize {
        32
    }

    fn configure(&mut self, _address: PhysicalAddress, _channel: u8) -> Result<(), Self::Error> {
        Ok(())
    }

    fn transmit(&mut self, _packet: &[u8]) -> Result<usize, Self::Error> {
        self.transmissions += 1;
        Ok(32)
    }

    fn receive(&mut self, _buffer: &mut [u8], timeout: Duration) -> Result<usize, Self::Error> {
        self.elapsed += timeout;
        Ok(0)
    }

    fn ready(&mut self) -> Result<bool, Self::Error> {
        Ok(false)
    }

    fn standby(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn now(&self) -> Instant {
        self.origin + self.elapsed
    }
}

#[test]
fn unanswered_reliable_send_gives_up_after_max_retries() {
    init_logger();
    let ether = Ether::new();
    let config = LinkConfig {
        ack_timeout: Duration::from_millis(5),
        ..LinkConfig::default()
    };
    let mut master = Link::new(ether.attach(), Node::master(0), config);

    let started = Instant::now();
    let result = master.send_reliable(Node::new(1, 0), 0x61u8, &[]);

    match result {
        Err(LinkError::NoAcknowledgement {
            node,
            command,
            attempts,
        }) => {
            assert_eq!(node, Node::new(1, 0));
            assert_eq!(command, 0x61);
            assert_eq!(attempts, MAX_RETRIES);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(master.device().transmissions(), MAX_RETRIES);
    assert!(started.elapsed() < master.config().reliable_budget() + Duration::from_secs(2));
}

#[test]
fn reliable_send_succeeds_after_losses() {
    init_logger();
    let ether = Ether::new();
    let mut master = Link::new(ether.attach(), Node::master(0), test_config());
    let master_station = master.device().station();
    let mut dropped = 0;
    ether.set_drop_rule(move |t| {
        if t.from == master_station && t.bytes[0] == 0x61 && dropped < 4 {
            dropped += 1;
            return true;
        }
        false
    });
    let (_, responder) = spawn_responder(&ether, Node::new(1, 0), 1);

    let ack = master.send_reliable(Node::new(1, 0), 0x61u8, &[1, 2, 3]).unwrap();
    assert!(ack.matches(0x61));
    assert_eq!(master.device().transmissions(), 5);

    let (_, served) = responder.join().unwrap();
    match &served[..] {
        [Served::Command(frame)] => {
            assert_eq!(frame.command, 0x61);
            assert_eq!(&frame.payload[..3], &[1, 2, 3]);
        }
        other => panic!("unexpected requests: {:?}", other),
    }
}

#[test]
fn unreliable_send_transmits_once() {
    init_logger();
    let ether = Ether::new();
    let mut master = Link::new(ether.attach(), Node::master(0), test_config());
    master
        .send_unreliable(Node::new(3, 0), Command::Announce, &[9])
        .unwrap();
    assert_eq!(master.device().transmissions(), 1);
}

#[test]
fn oversized_frame_is_refused() {
    init_logger();
    let ether = Ether::with_payload_size(8);
    let mut master = Link::new(ether.attach(), Node::master(0), test_config());
    let result = master.send_reliable(Node::new(1, 0), Command::Announce, &[0; 8]);
    assert!(matches!(result, Err(LinkError::FrameError(_))));
    assert_eq!(master.device().transmissions(), 0);
}

#[test]
fn timestamp_request() {
    init_logger();
    let ether = Ether::new();
    let mut master = Link::new(ether.attach(), Node::master(0), test_config());
    let (_, responder) = spawn_responder(&ether, Node::new(4, 0), 1);

    let timestamp = master.request_timestamp(Node::new(4, 0)).unwrap();

    let (_, served) = responder.join().unwrap();
    assert_eq!(served, vec![Served::Timestamp(timestamp)]);
}

#[test]
fn acknowledgement_without_timestamp() {
    init_logger();
    let ether = Ether::new();
    let mut master = Link::new(ether.attach(), Node::master(0), test_config());
    let mut slave = Link::new(ether.attach(), Node::new(4, 0), test_config());
    slave.receive_frame(Duration::ZERO).unwrap();
    let responder = thread::spawn(move || {
        let frame = slave.receive_frame(Duration::from_secs(2)).unwrap().unwrap();
        slave.acknowledge(Node::master(0), frame.command, None).unwrap();
    });

    let result = master.request_timestamp(Node::new(4, 0));
    assert!(matches!(result, Err(LinkError::MissingTimestamp { .. })));
    responder.join().unwrap();
}

#[test]
fn channel_change_moves_the_node() {
    init_logger();
    let ether = Ether::new();
    let mut master = Link::new(ether.attach(), Node::master(0), test_config());
    let (_, responder) = spawn_responder(&ether, Node::new(2, 0), 2);

    let moved = master.set_channel(Node::new(2, 0), 7).unwrap();
    assert_eq!(moved, Node::new(2, 7));
    let timestamp = master.request_timestamp(moved).unwrap();

    let (slave, served) = responder.join().unwrap();
    assert_eq!(
        served,
        vec![
            Served::ChannelChanged(Node::new(2, 7)),
            Served::Timestamp(timestamp)
        ]
    );
    assert_eq!(slave.node(), Node::new(2, 7));
    // The master keeps its identity.
    assert_eq!(master.node(), Node::master(0));
}

#[test]
fn invalid_channel_is_refused() {
    init_logger();
    let ether = Ether::new();
    let mut master = Link::new(ether.attach(), Node::master(0), test_config());
    assert!(matches!(
        master.set_channel(Node::new(2, 0), 128),
        Err(LinkError::InvalidChannel(128))
    ));
    assert_eq!(master.device().transmissions(), 0);
}

#[test]
fn retries_follow_the_device_clock() {
    init_logger();
    let config = LinkConfig {
        ack_timeout: Duration::from_secs(3600),
        ..LinkConfig::default()
    };
    let mut master = Link::new(SilentDevice::new(), Node::master(0), config);
    let started = Instant::now();

    let result = master.send_reliable(Node::new(1, 0), 0x61u8, &[]);
    assert!(matches!(result, Err(LinkError::NoAcknowledgement { attempts: MAX_RETRIES, .. })));
    assert_eq!(master.device().transmissions, MAX_RETRIES);
    assert_eq!(master.device().elapsed, master.config().reliable_budget());
    assert_eq!(master.uptime_ms(), 30 * 3_600_000);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn consecutive_sends_tune_the_radio_once() {
    init_logger();
    let ether = Ether::new();
    let mut master = Link::new(ether.attach(), Node::master(0), test_config());
    for _ in 0..3 {
        master
            .send_unreliable(Node::new(3, 0), Command::Announce, &[9])
            .unwrap();
    }
    assert_eq!(master.device().transmissions(), 3);
    assert_eq!(master.device().reconfigurations(), 1);
}

#[test]
fn exchanges_retune_between_peer_and_own_address() {
    init_logger();
    let ether = Ether::new();
    let mut master = Link::new(ether.attach(), Node::master(0), test_config());
    let (_, responder) = spawn_responder(&ether, Node::new(4, 0), 2);

    master.request_timestamp(Node::new(4, 0)).unwrap();
    master.request_timestamp(Node::new(4, 0)).unwrap();

    responder.join().unwrap();
    // Peer address to send, own address to hear the acknowledgement.
    assert_eq!(master.device().reconfigurations(), 4);
}
