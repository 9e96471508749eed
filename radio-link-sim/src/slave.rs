use std::sync::mpsc::SyncSender;
use std::time::{Duration, Instant};

use anyhow::bail;
use log::{debug, info};
use radio_link::device::sim::SimDevice;
use radio_link::{DeviceIdentity, Link, Node, Served, TransferStatus};

/// What a slave reports to the supervisor.
#[derive(Debug)]
pub enum SlaveEvent {
    Enumerated(DeviceIdentity, Node),
    Received(Node, Vec<u8>, TransferStatus),
}

/// A device waiting for its node id, then serving the master until it falls silent.
pub struct Slave {
    link: Link<SimDevice>,
    identity: DeviceIdentity,
    events: SyncSender<SlaveEvent>,
}

impl Slave {
    pub fn new(link: Link<SimDevice>, identity: DeviceIdentity, events: SyncSender<SlaveEvent>) -> Self {
        Self {
            link,
            identity,
            events,
        }
    }

    pub fn run(mut self, idle: Duration) -> anyhow::Result<()> {
        let node = self.join_network(idle)?;
        self.events.send(SlaveEvent::Enumerated(self.identity, node))?;

        loop {
            let master = Node::master(self.link.node().channel);
            match self.link.serve(master, idle)? {
                Some(Served::Bulk { data, status }) => {
                    info!("{}: {} bytes received ({:?}).", self.link.node(), data.len(), status);
                    self.events.send(SlaveEvent::Received(self.link.node(), data, status))?;
                }
                Some(Served::Timestamp(timestamp)) => debug!("{}: clock read at {}ms.", self.link.node(), timestamp),
                Some(Served::ChannelChanged(node)) => info!("Moved to {}.", node),
                Some(Served::Command(frame)) => debug!("{}: command {:#04x}.", self.link.node(), frame.command),
                None => {
                    info!("{}: master silent, stopping.", self.link.node());
                    self.link.standby()?;
                    return Ok(());
                }
            }
        }
    }

    fn join_network(&mut self, idle: Duration) -> anyhow::Result<Node> {
        let started = Instant::now();
        while started.elapsed() < idle {
            if let Some(node) = self.link.respond_to_enumeration(&self.identity, idle)? {
                return Ok(node);
            }
        }
        bail!("Device {} was never enumerated.", self.identity)
    }
}
