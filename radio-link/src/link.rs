//! Reliable single-packet delivery (stop-and-wait ARQ) and the command service
//! built on top of it.
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::address::{Node, PhysicalAddress, MAX_CHANNEL};
use crate::bulk::TransferStatus;
use crate::config::LinkConfig;
use crate::device::Device;
use crate::error::LinkError;
use crate::frame::{AckFrame, ChannelSet, Command, DataStart, Frame, Message};

/// Protocol endpoint owning a radio device.
///
/// Every operation is blocking and runs alone on the device: one `Link` per radio,
/// created once at startup and handed to whoever drives the protocol.
pub struct Link<D: Device> {
    device: D,
    node: Node,
    // Channel of the current exchange, the peer's one after a transmission.
    channel: u8,
    config: LinkConfig,
    tuned: Option<(PhysicalAddress, u8)>,
    epoch: Instant,
}

/// What [Link::serve] did with the frame it received.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Served {
    /// Answered a `TIMESTAMP_REQ` with this uptime (ms).
    Timestamp(u32),
    /// Moved to another channel on `CHANNEL_SET`, here is the new identity.
    ChannelChanged(Node),
    /// Ran a bulk receive session opened by `DATA_START`.
    Bulk { data: Vec<u8>, status: TransferStatus },
    /// Acknowledged a command this layer does not handle itself.
    Command(Frame),
}

impl<D: Device> Link<D> {
    pub fn new(device: D, node: Node, config: LinkConfig) -> Self {
        let epoch = device.now();
        Self {
            device,
            node,
            channel: node.channel,
            config,
            tuned: None,
            epoch,
        }
    }

    /// Identity this link listens on.
    ///
    /// Replies are awaited on this address but on the channel of the last
    /// transmission, so a master reaches nodes on any channel.
    pub fn node(&self) -> Node {
        self.node
    }

    pub fn set_node(&mut self, node: Node) {
        self.node = node;
        self.channel = node.channel;
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    /// Milliseconds since the link was created, wrapping.
    pub fn uptime_ms(&self) -> u32 {
        self.device.now().saturating_duration_since(self.epoch).as_millis() as u32
    }

    /// Puts the radio in standby.
    pub fn standby(&mut self) -> Result<(), LinkError<D::Error>> {
        self.device
            .standby()
            .map_err(LinkError::InternalRadioError)
    }

    /// Transmits a frame once, without waiting for anything.
    pub fn send_unreliable(
        &mut self,
        node: Node,
        command: impl Into<u8>,
        payload: &[u8],
    ) -> Result<(), LinkError<D::Error>> {
        self.send_frame(node, &Frame::new(command, payload))
    }

    /// Transmits a frame until `node` acknowledges it, at most
    /// [max_retries](LinkConfig::max_retries) times.
    pub fn send_reliable(
        &mut self,
        node: Node,
        command: impl Into<u8>,
        payload: &[u8],
    ) -> Result<AckFrame, LinkError<D::Error>> {
        self.send_reliable_frame(node, &Frame::new(command, payload))
    }

    /// Acknowledges `command_echo` to `node`, after the turnaround delay.
    pub fn acknowledge(
        &mut self,
        node: Node,
        command_echo: impl Into<u8>,
        timestamp: Option<u32>,
    ) -> Result<(), LinkError<D::Error>> {
        let mut ack = AckFrame::new(command_echo);
        ack.timestamp = timestamp;
        self.acknowledge_with(node, &ack)
    }

    pub fn acknowledge_with(&mut self, node: Node, ack: &AckFrame) -> Result<(), LinkError<D::Error>> {
        let frame = ack.to_frame();
        frame.check_fits(self.device.payload_size())?;
        self.tune(node.address(), node.channel)?;
        self.pause(self.config.turnaround);
        self.send_frame(node, &frame)
    }

    /// Waits at most `timeout` for any frame addressed to this link.
    pub fn receive_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, LinkError<D::Error>> {
        let mut buf = vec![0u8; self.device.payload_size()];
        let n = self.receive_raw(&mut buf, timeout)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Frame::try_from_bytes(&buf[..n])?))
    }

    /// Reads the clock of `node`.
    pub fn request_timestamp(&mut self, node: Node) -> Result<u32, LinkError<D::Error>> {
        let ack = self.send_reliable(node, Command::TimestampReq, &[])?;
        ack.timestamp.ok_or(LinkError::MissingTimestamp {
            command: Command::TimestampReq as u8,
        })
    }

    /// Moves `node` to `channel`. Returns the node as it must be addressed from now on.
    pub fn set_channel(&mut self, node: Node, channel: u8) -> Result<Node, LinkError<D::Error>> {
        if channel > MAX_CHANNEL {
            return Err(LinkError::InvalidChannel(channel));
        }
        self.send_reliable_frame(node, &ChannelSet { channel }.to_frame())?;
        info!("{} moved to channel {}", node, channel);
        Ok(node.on_channel(channel))
    }

    /// Waits at most `timeout` for a command from `peer` and handles it.
    ///
    /// Clock requests, channel changes and bulk transfers are handled here. Any other
    /// command is acknowledged and handed back to the caller. Stray protocol frames
    /// (late acknowledgements, enumeration or transfer control) are skipped.
    ///
    /// Frames this layer acts on must carry nothing but zero padding after their
    /// payload. One that does not is taken for a data packet whose `DATA_START` was
    /// lost, and the rest of its burst is dropped unread.
    pub fn serve(&mut self, peer: Node, timeout: Duration) -> Result<Option<Served>, LinkError<D::Error>> {
        let deadline = self.device.now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(self.device.now());
            let frame = match self.receive_frame(remaining)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            match frame.kind() {
                Some(Command::Ack) => match AckFrame::try_from_padded_frame(&frame) {
                    Ok(ack) => trace!("Late acknowledgement of {:#04x} ignored.", ack.command_echo),
                    Err(_) => self.skip_burst(deadline)?,
                },
                Some(Command::DeviceIdGet)
                | Some(Command::DeviceIdResponse)
                | Some(Command::EnumerateDevice)
                | Some(Command::ResendPacket)
                | Some(Command::AllPacketsReceived) => {
                    trace!("Stray {:?} frame ignored.", frame.kind());
                }
                Some(Command::TimestampReq) if frame.is_padded_from(0) => {
                    let timestamp = self.uptime_ms();
                    self.acknowledge(peer, frame.command, Some(timestamp))?;
                    return Ok(Some(Served::Timestamp(timestamp)));
                }
                Some(Command::TimestampReq) => self.skip_burst(deadline)?,
                Some(Command::ChannelSet) => match ChannelSet::try_from_padded_frame(&frame) {
                    Ok(ChannelSet { channel }) if channel <= MAX_CHANNEL => {
                        self.acknowledge(peer, frame.command, None)?;
                        self.set_node(self.node.on_channel(channel));
                        info!("Now listening on channel {}.", channel);
                        return Ok(Some(Served::ChannelChanged(self.node)));
                    }
                    Ok(ChannelSet { channel }) => warn!("Invalid channel change to {} ignored.", channel),
                    Err(_) => self.skip_burst(deadline)?,
                },
                Some(Command::DataStart) => match DataStart::try_from_padded_frame(&frame) {
                    Ok(DataStart { total_size }) => {
                        let (session, status) = self.receive_session(peer, total_size as usize)?;
                        return Ok(Some(Served::Bulk {
                            data: session.into_data(),
                            status,
                        }));
                    }
                    Err(_) => self.skip_burst(deadline)?,
                },
                _ => {
                    self.acknowledge(peer, frame.command, None)?;
                    return Ok(Some(Served::Command(frame)));
                }
            }
        }
    }

    pub(crate) fn send_frame(&mut self, node: Node, frame: &Frame) -> Result<(), LinkError<D::Error>> {
        frame.check_fits(self.device.payload_size())?;
        self.transmit_raw(node, &frame.to_bytes())?;
        Ok(())
    }

    pub(crate) fn send_reliable_frame(
        &mut self,
        node: Node,
        frame: &Frame,
    ) -> Result<AckFrame, LinkError<D::Error>> {
        frame.check_fits(self.device.payload_size())?;
        let command = frame.command;
        for attempt in 1..=self.config.max_retries {
            self.send_frame(node, frame)?;
            let timeout = self.config.ack_timeout;
            let ack = self.wait_for(timeout, |f| {
                AckFrame::try_from_frame(f)
                    .ok()
                    .filter(|ack| ack.matches(command))
            })?;
            if let Some(ack) = ack {
                debug!("Command {:#04x} acknowledged by {} (attempt {}).", command, node, attempt);
                return Ok(ack);
            }
            trace!("No acknowledgement of {:#04x} from {} (attempt {}).", command, node, attempt);
        }
        warn!("{} never acknowledged command {:#04x}.", node, command);
        Err(LinkError::NoAcknowledgement {
            node,
            command,
            attempts: self.config.max_retries,
        })
    }

    /// Receives frames until `accept` returns a value or `timeout` elapses.
    /// Rejected frames are discarded, they do not extend the wait.
    pub(crate) fn wait_for<T>(
        &mut self,
        timeout: Duration,
        mut accept: impl FnMut(&Frame) -> Option<T>,
    ) -> Result<Option<T>, LinkError<D::Error>> {
        let deadline = self.device.now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(self.device.now());
            match self.receive_frame(remaining)? {
                Some(frame) => match accept(&frame) {
                    Some(value) => return Ok(Some(value)),
                    None => trace!("Frame {:#04x} discarded while waiting.", frame.command),
                },
                None => return Ok(None),
            }
        }
    }

    // Reads packets until the line stays silent for a packet timeout, or `deadline`.
    fn skip_burst(&mut self, deadline: Instant) -> Result<(), LinkError<D::Error>> {
        let silence = self.config.transfer.packet_timeout;
        let mut buf = vec![0u8; self.device.payload_size()];
        let mut skipped = 1;
        loop {
            let remaining = deadline.saturating_duration_since(self.device.now());
            if self.receive_raw(&mut buf, silence.min(remaining))? == 0 {
                break;
            }
            skipped += 1;
        }
        debug!("Dropped {} packets of a transfer without DATA_START.", skipped);
        Ok(())
    }

    /// Throws away every packet already buffered by the radio.
    pub(crate) fn drain(&mut self) -> Result<(), LinkError<D::Error>> {
        let mut buf = vec![0u8; self.device.payload_size()];
        self.listen()?;
        while self.device.ready().map_err(LinkError::InternalRadioError)? {
            if self.receive_raw(&mut buf, Duration::ZERO)? == 0 {
                break;
            }
            trace!("Stale packet drained.");
        }
        Ok(())
    }

    pub(crate) fn transmit_raw(&mut self, node: Node, packet: &[u8]) -> Result<usize, LinkError<D::Error>> {
        self.tune(node.address(), node.channel)?;
        self.channel = node.channel;
        self.device
            .transmit(packet)
            .map_err(LinkError::InternalRadioError)
    }

    /// Listens on this link's own address for at most `timeout`.
    pub(crate) fn receive_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError<D::Error>> {
        self.listen()?;
        self.device
            .receive(buf, timeout)
            .map_err(LinkError::InternalRadioError)
    }

    pub(crate) fn pause(&mut self, delay: Duration) {
        if !delay.is_zero() {
            self.device.delay_ms(delay.as_millis() as u32);
        }
    }

    /// Space available for data in a packet.
    pub(crate) fn chunk_size(&self) -> usize {
        self.device.payload_size() - 1
    }

    fn listen(&mut self) -> Result<(), LinkError<D::Error>> {
        let address = self.node.address();
        self.tune(address, self.channel)
    }

    // Reprogramming the radio is slow: only do it on change.
    fn tune(&mut self, address: PhysicalAddress, channel: u8) -> Result<(), LinkError<D::Error>> {
        if self.tuned == Some((address, channel)) {
            return Ok(());
        }
        self.device
            .configure(address, channel)
            .map_err(LinkError::InternalRadioError)?;
        self.tuned = Some((address, channel));
        Ok(())
    }
}
