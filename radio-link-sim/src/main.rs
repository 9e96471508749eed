use std::sync::mpsc::sync_channel;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use log::info;
use radio_link::address::BROADCAST_CHANNEL;
use radio_link::device::sim::Ether;
use radio_link::{DeviceIdentity, Link, LinkConfig, Node};

mod master;
mod slave;

use master::Master;
use slave::{Slave, SlaveEvent};

const IDENTITIES: [[u8; 8]; 3] = [
    [0x13, 0x37, 0x00, 0x00, 0xCA, 0xFE, 0x00, 0x01],
    [0x24, 0x11, 0x9A, 0x00, 0xCA, 0xFE, 0x00, 0x02],
    [0x3B, 0x82, 0x41, 0x00, 0xCA, 0xFE, 0x00, 0x03],
];
const MOVED_CHANNEL: u8 = 5;
const LOSS_PERIOD: usize = 3; // One data packet lost out of LOSS_PERIOD
const SLAVE_IDLE: Duration = Duration::from_secs(3);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let ether = Ether::new();
    let config = LinkConfig::default();
    let (sender, receiver) = sync_channel(16);

    let slaves: Vec<_> = IDENTITIES
        .iter()
        .map(|bytes| {
            let link = Link::new(ether.attach(), Node::unassigned(), config.clone());
            let slave = Slave::new(link, DeviceIdentity::new(*bytes), sender.clone());
            thread::spawn(move || slave.run(SLAVE_IDLE))
        })
        .collect();
    drop(sender);

    let mut master = Master::new(Link::new(
        ether.attach(),
        Node::master(BROADCAST_CHANNEL),
        config,
    ));
    thread::sleep(Duration::from_millis(50));

    let nodes = master.enumerate(IDENTITIES.len(), 3)?;
    master.read_clocks(&nodes)?;
    if let Some(last) = nodes.last() {
        master.move_node(*last, MOVED_CHANNEL)?;
    }
    let nodes = master.nodes();
    master.read_clocks(&nodes)?;

    // Sequences 1 to 3 never start a frame the master sends during a transfer.
    let master_station = master.link().device().station();
    let mut data_packets = 0;
    ether.set_drop_rule(move |t| {
        if t.from != master_station || !(1..=3).contains(&t.bytes[0]) {
            return false;
        }
        data_packets += 1;
        data_packets % LOSS_PERIOD == 0
    });

    let data: Vec<u8> = "Bonjour! Un message un peu long, envoye en plusieurs paquets. "
        .bytes()
        .cycle()
        .take(200)
        .collect();
    master.broadcast_bulk(&nodes, &data)?;
    ether.clear_drop_rule();

    for slave in slaves {
        slave
            .join()
            .map_err(|_| anyhow!("Slave thread panicked!"))??;
    }

    let mut delivered = 0;
    for event in receiver.try_iter() {
        match event {
            SlaveEvent::Enumerated(identity, node) => info!("{} was enumerated as {}.", identity, node),
            SlaveEvent::Received(node, payload, status) => {
                if !status.is_complete() || payload != data {
                    bail!("{} got a corrupted transfer ({:?}).", node, status);
                }
                delivered += 1;
            }
        }
    }
    if delivered != nodes.len() {
        bail!("Only {} of {} slaves got the data.", delivered, nodes.len());
    }

    info!(
        "Done: {} slaves, {} packets sent by the master.",
        nodes.len(),
        master.link().device().transmissions()
    );
    Ok(())
}
