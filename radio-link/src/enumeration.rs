//! Node id assignment.
//!
//! The master broadcasts `DEVICE_ID_GET` to the unassigned address on the broadcast
//! channel. Every unassigned device answers with its identity after a back-off
//! derived from it, until the master claims one of them with `ENUMERATE_DEVICE`.
//! Devices hearing a claim for another identity drop out of the round and wait for
//! the next `DEVICE_ID_GET`.
//!
//! The back-off only uses the low nibble of each identity byte: devices sharing
//! these nibbles answer at the same time on every try and collide.
//!
//! Claims are not acknowledged. A device that missed every copy of its claim stays
//! registered on the master but unassigned, and its later answers are ignored unless
//! [reclaim](crate::config::EnumerationParams::reclaim) is set, in which case the
//! master sends the claim again with the id it already gave.
use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::address::{DeviceIdentity, Node, BROADCAST_CHANNEL, MAX_ASSIGNABLE_ID};
use crate::device::Device;
use crate::error::LinkError;
use crate::frame::{Command, DeviceIdResponse, EnumerateDevice, Message};
use crate::link::Link;

/// Identities known to the master and the nodes they were given.
///
/// Ids are handed out in increasing order and never reused.
#[derive(Clone, Debug, Default)]
pub struct EnumerationRegistry {
    devices: BTreeMap<DeviceIdentity, Node>,
    next_id: u16,
}

impl EnumerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, identity: &DeviceIdentity) -> bool {
        self.devices.contains_key(identity)
    }

    pub fn get(&self, identity: &DeviceIdentity) -> Option<Node> {
        self.devices.get(identity).copied()
    }

    /// Node of `identity`, assigning the next free id to unknown identities.
    /// `None` once every id is taken.
    pub fn register(&mut self, identity: DeviceIdentity) -> Option<Node> {
        if let Some(node) = self.get(&identity) {
            return Some(node);
        }
        if self.next_id > MAX_ASSIGNABLE_ID as u16 {
            return None;
        }
        let node = Node::new(self.next_id as u8, BROADCAST_CHANNEL);
        self.next_id += 1;
        self.devices.insert(identity, node);
        Some(node)
    }

    /// Records that `identity` now lives on another channel.
    pub fn update(&mut self, identity: &DeviceIdentity, node: Node) -> bool {
        match self.devices.get_mut(identity) {
            Some(known) if known.id == node.id => {
                *known = node;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Known nodes, by increasing id.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.devices.values().copied().collect();
        nodes.sort_by_key(|node| node.id);
        nodes
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceIdentity, &Node)> {
        self.devices.iter()
    }
}

impl<D: Device> Link<D> {
    /// Discovers up to `max_devices` unassigned devices and gives each one a node id.
    ///
    /// Runs on the broadcast channel, the link gets its own node back afterwards.
    /// Returns every node of the registry.
    pub fn enumerate(
        &mut self,
        registry: &mut EnumerationRegistry,
        max_devices: usize,
    ) -> Result<Vec<Node>, LinkError<D::Error>> {
        let home = self.node();
        if !home.is_master() {
            warn!("Enumeration run by {}, not by the master.", home);
        }
        self.set_node(Node::master(BROADCAST_CHANNEL));
        let result = self.discover(registry, max_devices);
        self.set_node(home);
        result?;
        Ok(registry.nodes())
    }

    /// Takes part in an enumeration as an unassigned device.
    ///
    /// Waits at most `timeout` for a `DEVICE_ID_GET`, then answers it until claimed or
    /// out of back-off tries. On success the link takes the assigned node and returns
    /// it. `None` means another device won this round: call again for the next one.
    pub fn respond_to_enumeration(
        &mut self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<Option<Node>, LinkError<D::Error>> {
        let master = Node::master(BROADCAST_CHANNEL);
        let params = self.config().enumeration.clone();
        self.set_node(Node::unassigned());

        if self.wait_for(timeout, |frame| frame.is(Command::DeviceIdGet).then_some(()))?.is_none() {
            trace!("No enumeration request.");
            return Ok(None);
        }
        let response = DeviceIdResponse {
            identity: *identity,
        }
        .to_frame();

        for byte in identity.as_bytes() {
            let backoff = Duration::from_millis((byte & 0x0F) as u64) + params.backoff_offset;
            self.pause(backoff);
            self.send_frame(master, &response)?;

            let claim = self.wait_for(params.claim_window, |frame| EnumerateDevice::try_from_frame(frame).ok())?;
            match claim {
                Some(claim) if claim.identity == *identity => {
                    let node = Node::new(claim.node_id, BROADCAST_CHANNEL);
                    self.acknowledge(master, Command::EnumerateDevice, None)?;
                    self.set_node(node);
                    info!("Enumerated as {}.", node);
                    return Ok(Some(node));
                }
                Some(claim) => {
                    debug!("Round won by {}.", claim.identity);
                    return Ok(None);
                }
                None => trace!("Not claimed, backing off again."),
            }
        }
        debug!("No claim after {} responses.", identity.as_bytes().len());
        Ok(None)
    }

    fn discover(&mut self, registry: &mut EnumerationRegistry, max_devices: usize) -> Result<(), LinkError<D::Error>> {
        let params = self.config().enumeration.clone();
        for _ in 0..max_devices {
            let identity = match self.solicit(registry)? {
                Some(identity) => identity,
                None => {
                    debug!("No more unassigned devices.");
                    return Ok(());
                }
            };
            let known = registry.contains(&identity);
            let node = registry.register(identity).ok_or(LinkError::NodeIdsExhausted)?;
            if known {
                info!("Device {} claimed again as {}.", identity, node);
            } else {
                info!("Device {} enumerated as {}.", identity, node);
            }

            let claim = EnumerateDevice {
                identity,
                node_id: node.id,
            }
            .to_frame();
            for _ in 0..params.unack_repeat {
                self.send_frame(Node::unassigned(), &claim)?;
                self.pause(params.unack_gap);
            }
        }
        Ok(())
    }

    // One discovery round: the first identity not in the registry to answer, or any
    // identity when reclaiming.
    fn solicit(&mut self, registry: &EnumerationRegistry) -> Result<Option<DeviceIdentity>, LinkError<D::Error>> {
        let params = self.config().enumeration.clone();
        let reclaim = params.reclaim;
        for _ in 0..params.repeat {
            self.drain()?;
            self.send_unreliable(Node::unassigned(), Command::DeviceIdGet, &[])?;
            let identity = self.wait_for(params.response_window, |frame| {
                DeviceIdResponse::try_from_frame(frame)
                    .ok()
                    .map(|response| response.identity)
                    .filter(|identity| reclaim || !registry.contains(identity))
            })?;
            if identity.is_some() {
                return Ok(identity);
            }
        }
        Ok(None)
    }
}
