//! Simulated radio medium.
//!
//! Stations attached to the same [Ether] see each other's transmissions as a real
//! half-duplex transceiver would: a packet only reaches the stations that are in
//! receive mode on the address and channel it was sent to. Each station buffers
//! received packets in a bounded FIFO until read.
//!
//! ```rust,ignore
//! let ether = Ether::new();
//! let master = Link::new(ether.attach(), Node::master(0), LinkConfig::default());
//! let slave = Link::new(ether.attach(), Node::unassigned(), LinkConfig::default());
//! ```
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use embedded_hal::blocking::delay::DelayMs;
use log::trace;
use ringbuf::ring_buffer::RbBase;
use ringbuf::{HeapRb, Rb};

use super::device::Device;
use super::radio::DEFAULT_PAYLOAD_SIZE;
use crate::address::{PhysicalAddress, DEFAULT_ADDRESS};

/// Packets a station can buffer before dropping new ones.
pub const DEFAULT_FIFO_DEPTH: usize = 64;

/// A packet on the air, as seen by a drop rule.
#[derive(Debug)]
pub struct Transmission<'a> {
    /// Station that transmitted it.
    pub from: usize,
    pub address: PhysicalAddress,
    pub channel: u8,
    /// Padded packet.
    pub bytes: &'a [u8],
}

/// Loss injection: returns `true` to drop the transmission.
pub type DropRule = Box<dyn FnMut(&Transmission<'_>) -> bool + Send>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Mode {
    Standby,
    Receive,
}

struct Station {
    address: PhysicalAddress,
    channel: u8,
    mode: Mode,
    fifo: HeapRb<Vec<u8>>,
    transmissions: usize,
    reconfigurations: usize,
}

struct Medium {
    stations: Vec<Station>,
    drop_rule: Option<DropRule>,
    fifo_depth: usize,
}

/// Shared medium the simulated devices transmit on.
#[derive(Clone)]
pub struct Ether {
    shared: Arc<(Mutex<Medium>, Condvar)>,
    payload_size: usize,
}

impl Default for Ether {
    fn default() -> Self {
        Self::new()
    }
}

impl Ether {
    pub fn new() -> Self {
        Self::with_payload_size(DEFAULT_PAYLOAD_SIZE)
    }

    pub fn with_payload_size(payload_size: usize) -> Self {
        assert!(payload_size > 1, "Payload size too small!");
        Self {
            shared: Arc::new((
                Mutex::new(Medium {
                    stations: Vec::new(),
                    drop_rule: None,
                    fifo_depth: DEFAULT_FIFO_DEPTH,
                }),
                Condvar::new(),
            )),
            payload_size,
        }
    }

    /// Creates a new station on this medium.
    pub fn attach(&self) -> SimDevice {
        let mut medium = self.lock_unpoisoned();
        let fifo_depth = medium.fifo_depth;
        medium.stations.push(Station {
            address: DEFAULT_ADDRESS,
            channel: 0,
            mode: Mode::Standby,
            fifo: HeapRb::new(fifo_depth),
            transmissions: 0,
            reconfigurations: 0,
        });
        SimDevice {
            ether: self.clone(),
            station: medium.stations.len() - 1,
        }
    }

    /// FIFO depth of the stations attached afterwards.
    pub fn set_fifo_depth(&self, depth: usize) {
        self.lock_unpoisoned().fifo_depth = depth.max(1);
    }

    /// Installs a loss rule, replacing the previous one.
    pub fn set_drop_rule<F>(&self, rule: F)
    where
        F: FnMut(&Transmission<'_>) -> bool + Send + 'static,
    {
        self.lock_unpoisoned().drop_rule = Some(Box::new(rule));
    }

    pub fn clear_drop_rule(&self) {
        self.lock_unpoisoned().drop_rule = None;
    }

    /// Packets transmitted by `station` so far.
    pub fn transmissions(&self, station: usize) -> usize {
        self.lock_unpoisoned().stations[station].transmissions
    }

    /// Calls to `configure` by `station` so far, each one counts as reprogramming
    /// the radio even when nothing changes.
    pub fn reconfigurations(&self, station: usize) -> usize {
        self.lock_unpoisoned().stations[station].reconfigurations
    }

    // Stats and setup stay usable after a peer thread panicked.
    fn lock_unpoisoned(&self) -> MutexGuard<'_, Medium> {
        self.shared
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Medium>, SimError> {
        self.shared.0.lock().map_err(|_| SimError::Poisoned)
    }
}

/// A station of an [Ether].
pub struct SimDevice {
    ether: Ether,
    station: usize,
}

impl SimDevice {
    /// Index of this station, used by [Transmission::from] and the counters.
    pub fn station(&self) -> usize {
        self.station
    }

    pub fn transmissions(&self) -> usize {
        self.ether.transmissions(self.station)
    }

    pub fn reconfigurations(&self) -> usize {
        self.ether.reconfigurations(self.station)
    }
}

impl DelayMs<u32> for SimDevice {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

impl Device for SimDevice {
    type Error = SimError;

    fn payload_size(&self) -> usize {
        self.ether.payload_size
    }

    fn configure(&mut self, address: PhysicalAddress, channel: u8) -> Result<(), Self::Error> {
        let mut medium = self.ether.lock()?;
        let station = &mut medium.stations[self.station];
        station.address = address;
        station.channel = channel;
        station.reconfigurations += 1;
        Ok(())
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<usize, Self::Error> {
        let mut bytes = packet[..packet.len().min(self.ether.payload_size)].to_vec();
        bytes.resize(self.ether.payload_size, 0);

        let mut medium = self.ether.lock()?;
        let Medium {
            stations,
            drop_rule,
            ..
        } = &mut *medium;
        let (address, channel) = {
            let station = &mut stations[self.station];
            station.mode = Mode::Standby;
            station.transmissions += 1;
            (station.address, station.channel)
        };
        let transmission = Transmission {
            from: self.station,
            address,
            channel,
            bytes: &bytes,
        };
        if let Some(rule) = drop_rule.as_mut() {
            if rule(&transmission) {
                trace!("Station {} packet dropped on air", self.station);
                return Ok(bytes.len());
            }
        }
        for (i, station) in stations.iter_mut().enumerate() {
            if i == self.station
                || station.mode != Mode::Receive
                || station.address != address
                || station.channel != channel
            {
                continue;
            }
            if station.fifo.push(bytes.clone()).is_err() {
                trace!("Station {} receive FIFO full, packet lost", i);
            }
        }
        drop(medium);
        self.ether.shared.1.notify_all();
        Ok(bytes.len())
    }

    fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, Self::Error> {
        let deadline = Instant::now() + timeout;
        let cvar = &self.ether.shared.1;
        let mut medium = self.ether.lock()?;
        medium.stations[self.station].mode = Mode::Receive;
        loop {
            if let Some(packet) = medium.stations[self.station].fifo.pop() {
                let len = packet.len().min(buffer.len());
                buffer[..len].copy_from_slice(&packet[..len]);
                return Ok(len);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            medium = cvar
                .wait_timeout(medium, deadline - now)
                .map_err(|_| SimError::Poisoned)?
                .0;
        }
    }

    fn ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.ether.lock()?.stations[self.station].fifo.is_empty())
    }

    fn standby(&mut self) -> Result<(), Self::Error> {
        self.ether.lock()?.stations[self.station].mode = Mode::Standby;
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        if let Ok(mut medium) = self.ether.lock() {
            medium.stations[self.station].mode = Mode::Standby;
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SimError {
    #[error("Simulated medium poisoned by a panicking station.")]
    Poisoned,
}
