use anyhow::{bail, Context};
use log::{info, warn};
use radio_link::device::sim::SimDevice;
use radio_link::{EnumerationRegistry, Link, Node};

/// Network coordinator: enumerates the slaves, then talks to each of them.
pub struct Master {
    link: Link<SimDevice>,
    registry: EnumerationRegistry,
}

impl Master {
    pub fn new(link: Link<SimDevice>) -> Self {
        Self {
            link,
            registry: EnumerationRegistry::new(),
        }
    }

    pub fn enumerate(&mut self, expected: usize, attempts: usize) -> anyhow::Result<Vec<Node>> {
        for attempt in 1..=attempts {
            let nodes = self.link.enumerate(&mut self.registry, expected)?;
            info!("Enumeration pass {}: {} node(s).", attempt, nodes.len());
            if nodes.len() >= expected {
                return Ok(nodes);
            }
        }
        bail!(
            "Only {} of {} devices enumerated.",
            self.registry.len(),
            expected
        )
    }

    pub fn read_clocks(&mut self, nodes: &[Node]) -> anyhow::Result<()> {
        for node in nodes {
            let timestamp = self
                .link
                .request_timestamp(*node)
                .with_context(|| format!("Reading the clock of {}", node))?;
            info!("{} clock: {}ms.", node, timestamp);
        }
        Ok(())
    }

    /// Moves `node` to `channel`, keeping the registry up to date.
    pub fn move_node(&mut self, node: Node, channel: u8) -> anyhow::Result<Node> {
        let moved = self
            .link
            .set_channel(node, channel)
            .with_context(|| format!("Moving {} to channel {}", node, channel))?;
        let identity = self
            .registry
            .iter()
            .find(|(_, known)| known.id == node.id)
            .map(|(identity, _)| *identity);
        if let Some(identity) = identity {
            self.registry.update(&identity, moved);
        }
        Ok(moved)
    }

    /// Sends `data` to every node, failing on the first incomplete transfer.
    pub fn broadcast_bulk(&mut self, nodes: &[Node], data: &[u8]) -> anyhow::Result<()> {
        for node in nodes {
            let status = self.link.send_bulk(*node, data)?;
            if !status.is_complete() {
                warn!("Transfer to {} incomplete: {:?}", node, status);
                bail!("Transfer to {} incomplete ({} bytes unconfirmed).", node, status.bytes());
            }
            info!("{} bytes delivered to {}.", status.bytes(), node);
        }
        Ok(())
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.registry.nodes()
    }

    pub fn link(&self) -> &Link<SimDevice> {
        &self.link
    }
}
