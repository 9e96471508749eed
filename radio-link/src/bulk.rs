//! Bulk transfers: a buffer split in sequence-numbered packets, streamed after a
//! `DATA_START` and repaired with selective resend requests.
use std::fmt::Debug;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::address::Node;
use crate::device::Device;
use crate::error::LinkError;
use crate::frame::{Command, DataPacket, DataStart, Message, ResendPacket};
use crate::link::Link;

/// Distinct sequence numbers a data packet can carry. No session holds more packets,
/// whatever its configured capacity.
pub const SEQUENCE_SPACE: usize = u8::MAX as usize + 1;

/// Outcome of a bulk transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferStatus {
    /// Every packet made it, carrying this many bytes.
    Complete(usize),
    /// The session gave up. On the sender, the bytes streamed without confirmation;
    /// on the receiver, the bytes received without gap from the start.
    Partial(usize),
}

impl TransferStatus {
    pub fn bytes(&self) -> usize {
        match self {
            TransferStatus::Complete(n) | TransferStatus::Partial(n) => *n,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, TransferStatus::Complete(_))
    }
}

/// Receiver state of a bulk transfer: the reassembly buffer and which packets
/// arrived.
#[derive(Clone, Debug)]
pub struct TransferSession {
    chunk_size: usize,
    received: Vec<bool>,
    buffer: Vec<u8>,
}

impl TransferSession {
    /// Session for `total_size` bytes in chunks of `chunk_size`, `None` when it
    /// needs more than `capacity` packets or more than [SEQUENCE_SPACE].
    pub fn new(total_size: usize, chunk_size: usize, capacity: usize) -> Option<Self> {
        let packets = packet_count(total_size, chunk_size);
        if chunk_size == 0 || packets > capacity.min(SEQUENCE_SPACE) {
            return None;
        }
        Some(Self {
            chunk_size,
            received: vec![false; packets],
            buffer: vec![0u8; total_size],
        })
    }

    pub fn total_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn packet_count(&self) -> usize {
        self.received.len()
    }

    /// Stores a packet. Returns `false` for out of range or already received
    /// sequences, which are left untouched.
    pub fn accept(&mut self, packet: &DataPacket) -> bool {
        let index = packet.sequence as usize;
        match self.received.get(index) {
            Some(false) => {}
            _ => return false,
        }
        let offset = index * self.chunk_size;
        let len = self
            .chunk_size
            .min(self.buffer.len() - offset)
            .min(packet.chunk.len());
        self.buffer[offset..offset + len].copy_from_slice(&packet.chunk[..len]);
        self.received[index] = true;
        true
    }

    pub fn is_received(&self, index: usize) -> bool {
        self.received.get(index).copied().unwrap_or(false)
    }

    /// Lowest sequence not received yet.
    pub fn next_missing(&self) -> Option<usize> {
        self.received.iter().position(|received| !received)
    }

    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, received)| !**received)
            .map(|(index, _)| index)
    }

    pub fn is_complete(&self) -> bool {
        self.next_missing().is_none()
    }

    /// Bytes received without gap from the start of the buffer.
    pub fn contiguous_len(&self) -> usize {
        match self.next_missing() {
            Some(index) => index * self.chunk_size,
            None => self.buffer.len(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_data(self) -> Vec<u8> {
        self.buffer
    }
}

/// Packets needed to carry `size` bytes.
pub fn packet_count(size: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    (size + chunk_size - 1) / chunk_size
}

enum Control {
    Resend(u8),
    Done,
}

impl<D: Device> Link<D> {
    /// Sends `data` to `node` as a bulk transfer.
    ///
    /// Refuses transfers above the session capacity or the 16-bit size of
    /// `DATA_START` before anything is transmitted.
    pub fn send_bulk(&mut self, node: Node, data: &[u8]) -> Result<TransferStatus, LinkError<D::Error>> {
        let chunk_size = self.chunk_size();
        let packets = check_capacity(data.len(), chunk_size, self.config().transfer.max_packets)?;
        let params = self.config().transfer.clone();
        info!("Sending {}B to {} in {} packets.", data.len(), node, packets);

        let total_size = data.len() as u16;
        self.send_frame(node, &DataStart { total_size }.to_frame())?;
        self.pause(params.settle_delay);

        let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
        for (sequence, chunk) in chunks.iter().enumerate() {
            self.send_packet(node, sequence as u8, chunk)?;
            self.pause(params.packet_gap);
        }

        let max_requests = packets * self.config().max_retries;
        let mut requests = 0;
        loop {
            let control = self.wait_for(params.control_timeout, |frame| match frame.kind() {
                Some(Command::ResendPacket) => ResendPacket::try_from_frame(frame)
                    .ok()
                    .map(|request| Control::Resend(request.index)),
                Some(Command::AllPacketsReceived) => Some(Control::Done),
                _ => None,
            })?;
            match control {
                Some(Control::Done) => {
                    self.acknowledge(node, Command::AllPacketsReceived, None)?;
                    info!("Transfer of {}B to {} complete.", data.len(), node);
                    return Ok(TransferStatus::Complete(data.len()));
                }
                Some(Control::Resend(index)) => {
                    self.acknowledge(node, Command::ResendPacket, None)?;
                    requests += 1;
                    if requests > max_requests {
                        warn!("Too many resend requests from {}, giving up.", node);
                        return Ok(TransferStatus::Partial(data.len()));
                    }
                    match chunks.get(index as usize) {
                        Some(chunk) => {
                            debug!("Resending packet {} to {}.", index, node);
                            self.pause(params.resend_delay);
                            self.send_packet(node, index, chunk)?;
                        }
                        None => warn!("Resend of unknown packet {} requested.", index),
                    }
                }
                None => {
                    warn!("Transfer to {} not confirmed in time.", node);
                    return Ok(TransferStatus::Partial(data.len()));
                }
            }
        }
    }

    /// Waits at most `timeout` for a bulk transfer and receives it into `buf`.
    ///
    /// `peer` is the node resend requests and the completion are sent to. Without any
    /// `DATA_START` in time, returns `Partial(0)`.
    pub fn recv_bulk(
        &mut self,
        peer: Node,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<TransferStatus, LinkError<D::Error>> {
        let start = self.wait_for(timeout, |frame| DataStart::try_from_frame(frame).ok())?;
        let total_size = match start {
            Some(DataStart { total_size }) => total_size as usize,
            None => {
                debug!("No transfer started.");
                return Ok(TransferStatus::Partial(0));
            }
        };
        if total_size > buf.len() {
            return Err(LinkError::BufferTooSmall {
                needed: total_size,
                available: buf.len(),
            });
        }
        let (session, status) = self.receive_session(peer, total_size)?;
        buf[..total_size].copy_from_slice(session.data());
        Ok(status)
    }

    /// Receiver side of a transfer whose `DATA_START` was just received.
    pub(crate) fn receive_session(
        &mut self,
        peer: Node,
        total_size: usize,
    ) -> Result<(TransferSession, TransferStatus), LinkError<D::Error>> {
        let chunk_size = self.chunk_size();
        let capacity = self.config().transfer.max_packets;
        let mut session = match TransferSession::new(total_size, chunk_size, capacity) {
            Some(session) => session,
            None => {
                return Err(LinkError::TransferTooLarge {
                    size: total_size,
                    packets: packet_count(total_size, chunk_size),
                    max: capacity.min(SEQUENCE_SPACE),
                })
            }
        };
        debug!("Receiving {}B in {} packets from {}.", total_size, session.packet_count(), peer);
        self.collect_packets(&mut session)?;

        let max_requests = session.packet_count() * self.config().max_retries;
        let mut requests = 0;
        while let Some(index) = session.next_missing() {
            if requests >= max_requests {
                warn!("Packet {} still missing, giving up.", index);
                let received = session.contiguous_len();
                return Ok((session, TransferStatus::Partial(received)));
            }
            requests += 1;
            debug!("Requesting packet {} again.", index);
            let request = ResendPacket { index: index as u8 }.to_frame();
            match self.send_reliable_frame(peer, &request) {
                Ok(_) => self.collect_packets(&mut session)?,
                Err(LinkError::NoAcknowledgement { .. }) => {
                    warn!("{} stopped answering resend requests.", peer);
                    let received = session.contiguous_len();
                    return Ok((session, TransferStatus::Partial(received)));
                }
                Err(err) => return Err(err),
            }
        }

        self.send_unreliable(peer, Command::AllPacketsReceived, &[])?;
        info!("Received {}B from {}.", total_size, peer);
        Ok((session, TransferStatus::Complete(total_size)))
    }

    fn send_packet(&mut self, node: Node, sequence: u8, chunk: &[u8]) -> Result<(), LinkError<D::Error>> {
        let packet = DataPacket {
            sequence,
            chunk: chunk.to_vec(),
        };
        self.transmit_raw(node, &packet.to_bytes())?;
        Ok(())
    }

    // Stores packets until the line stays silent for a packet timeout.
    fn collect_packets(&mut self, session: &mut TransferSession) -> Result<(), LinkError<D::Error>> {
        let timeout = self.config().transfer.packet_timeout;
        let mut buf = vec![0u8; self.device().payload_size()];
        loop {
            let n = self.receive_raw(&mut buf, timeout)?;
            if n == 0 {
                return Ok(());
            }
            let packet = DataPacket::try_from_bytes(&buf[..n])?;
            if session.accept(&packet) {
                trace!("Packet {} stored.", packet.sequence);
            } else {
                trace!("Packet {} ignored.", packet.sequence);
            }
        }
    }
}

/// Packet count of a `size` bytes transfer, or why it cannot happen.
fn check_capacity<E: Debug>(size: usize, chunk_size: usize, max: usize) -> Result<usize, LinkError<E>> {
    let max = max.min(SEQUENCE_SPACE);
    let packets = packet_count(size, chunk_size);
    if size > u16::MAX as usize || chunk_size == 0 || packets > max {
        return Err(LinkError::TransferTooLarge { size, packets, max });
    }
    Ok(packets)
}
