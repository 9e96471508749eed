//! Wire representation of the frames exchanged over the radio.
//!
//! Every frame fits in a single PHY packet: byte 0 carries the command, the
//! remaining bytes a command-specific payload. Bulk transfer data packets are the
//! exception, their byte 0 being a sequence number (see [DataPacket]).
use bitflags::bitflags;

use crate::address::{DeviceIdentity, IDENTITY_WIDTH};

/// Trait to calculate size on frame for every component on frame.
pub trait FrameSize {
    /// Calculate component size on frame (meaning encoded) in bytes.
    fn size(&self) -> usize;
}

/// Protocol commands.
///
/// Both ends must agree on the numeric values, so the order is part of the
/// protocol: never reorder or insert in the middle.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Command {
    Ack = 0,
    Announce,
    Enumerate,
    EnumerateAck,
    DataStart,
    ChannelSet,
    TimestampReq,
    BroadcastMode,
    BroadcastExit,
    DeviceIdGet,
    DeviceIdResponse,
    EnumerateDevice,
    ResendPacket,
    AllPacketsReceived,
}

impl Command {
    const ALL: [Command; 14] = [
        Command::Ack,
        Command::Announce,
        Command::Enumerate,
        Command::EnumerateAck,
        Command::DataStart,
        Command::ChannelSet,
        Command::TimestampReq,
        Command::BroadcastMode,
        Command::BroadcastExit,
        Command::DeviceIdGet,
        Command::DeviceIdResponse,
        Command::EnumerateDevice,
        Command::ResendPacket,
        Command::AllPacketsReceived,
    ];
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Command::ALL
            .get(value as usize)
            .copied()
            .ok_or(FrameError::UnknownCommand(value))
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command as u8
    }
}

/// One radio packet: a command byte followed by its payload.
///
/// The command is kept as a raw byte, applications are free to use values outside
/// of [Command] for their own requests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<u8>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Protocol command of this frame, if it is one.
    pub fn kind(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    pub fn is(&self, command: Command) -> bool {
        self.command == command as u8
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.push(self.command);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Decodes a received packet. Trailing PHY padding stays in the payload.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        match bytes.split_first() {
            Some((command, payload)) => Ok(Self {
                command: *command,
                payload: payload.to_vec(),
            }),
            None => Err(FrameError::Empty),
        }
    }

    /// Whether every payload byte from `offset` on is zero, as PHY padding is.
    pub fn is_padded_from(&self, offset: usize) -> bool {
        self.payload.iter().skip(offset).all(|byte| *byte == 0)
    }

    /// Checks the encoded frame fits in a PHY packet of `payload_size` bytes.
    pub fn check_fits(&self, payload_size: usize) -> Result<(), FrameError> {
        check_fits(self.size(), payload_size)
    }
}

fn check_fits(size: usize, max: usize) -> Result<(), FrameError> {
    if size > max {
        return Err(FrameError::TooBigFrameError { size, max });
    }
    Ok(())
}

/// Typed payload of a protocol command.
pub trait Message: Sized {
    const COMMAND: Command;

    fn encode_payload(&self, bytes: &mut Vec<u8>);

    fn decode_payload(payload: &[u8]) -> Result<Self, FrameError>;

    fn to_frame(&self) -> Frame {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload);
        Frame::new(Self::COMMAND, payload)
    }

    fn try_from_frame(frame: &Frame) -> Result<Self, FrameError> {
        if !frame.is(Self::COMMAND) {
            return Err(FrameError::UnexpectedCommand {
                expected: Self::COMMAND,
                found: frame.command,
            });
        }
        Self::decode_payload(&frame.payload)
    }

    /// Strict [try_from_frame](Message::try_from_frame): the payload must encode
    /// back to the same bytes, followed by zero padding only.
    ///
    /// Bulk data packets can start with any command byte, this tells most of them
    /// apart from real frames.
    fn try_from_padded_frame(frame: &Frame) -> Result<Self, FrameError> {
        let message = Self::try_from_frame(frame)?;
        let mut encoded = Vec::new();
        message.encode_payload(&mut encoded);
        if !frame.payload.starts_with(&encoded) || !frame.is_padded_from(encoded.len()) {
            return Err(FrameError::Padding {
                command: Self::COMMAND,
            });
        }
        Ok(message)
    }
}

fn require(command: Command, payload: &[u8], min: usize) -> Result<(), FrameError> {
    if payload.len() < min {
        return Err(FrameError::Truncated {
            command,
            size: payload.len(),
            min,
        });
    }
    Ok(())
}

bitflags! {
    /// Optional sections present in an [AckFrame].
    pub struct AckFlags: u8 {
        const TIMESTAMP = 0b0000_0001;
        const PAYLOAD = 0b0000_0010;
    }
}

/// Acknowledgement of a previously received command.
///
/// Layout: `[ACK, command_echo, flags, timestamp (4B BE)?, len + payload?]`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AckFrame {
    pub command_echo: u8,
    pub timestamp: Option<u32>,
    pub payload: Vec<u8>,
}

impl AckFrame {
    pub fn new(command_echo: impl Into<u8>) -> Self {
        Self {
            command_echo: command_echo.into(),
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Whether this acknowledges `command`.
    pub fn matches(&self, command: u8) -> bool {
        self.command_echo == command
    }

    fn flags(&self) -> AckFlags {
        let mut flags = AckFlags::empty();
        if self.timestamp.is_some() {
            flags.insert(AckFlags::TIMESTAMP);
        }
        if !self.payload.is_empty() {
            flags.insert(AckFlags::PAYLOAD);
        }
        flags
    }
}

impl Message for AckFrame {
    const COMMAND: Command = Command::Ack;

    fn encode_payload(&self, bytes: &mut Vec<u8>) {
        bytes.push(self.command_echo);
        bytes.push(self.flags().bits());
        if let Some(timestamp) = self.timestamp {
            bytes.extend_from_slice(&timestamp.to_be_bytes());
        }
        if !self.payload.is_empty() {
            bytes.push(self.payload.len() as u8);
            bytes.extend_from_slice(&self.payload);
        }
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, FrameError> {
        require(Command::Ack, payload, 1)?;
        let mut ack = AckFrame::new(payload[0]);
        let flags = AckFlags::from_bits_truncate(payload.get(1).copied().unwrap_or(0));
        let mut cursor = 2;
        if flags.contains(AckFlags::TIMESTAMP) {
            require(Command::Ack, payload, cursor + 4)?;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&payload[cursor..cursor + 4]);
            ack.timestamp = Some(u32::from_be_bytes(raw));
            cursor += 4;
        }
        if flags.contains(AckFlags::PAYLOAD) {
            require(Command::Ack, payload, cursor + 1)?;
            let len = payload[cursor] as usize;
            require(Command::Ack, payload, cursor + 1 + len)?;
            ack.payload = payload[cursor + 1..cursor + 1 + len].to_vec();
        }
        Ok(ack)
    }
}

/// Opens a bulk transfer, announcing its total size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DataStart {
    pub total_size: u16,
}

impl Message for DataStart {
    const COMMAND: Command = Command::DataStart;

    fn encode_payload(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.total_size.to_be_bytes());
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, FrameError> {
        require(Self::COMMAND, payload, 2)?;
        Ok(Self {
            total_size: u16::from_be_bytes([payload[0], payload[1]]),
        })
    }
}

/// Receiver request for one missing packet of a bulk transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ResendPacket {
    pub index: u8,
}

impl Message for ResendPacket {
    const COMMAND: Command = Command::ResendPacket;

    fn encode_payload(&self, bytes: &mut Vec<u8>) {
        bytes.push(self.index);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, FrameError> {
        require(Self::COMMAND, payload, 1)?;
        Ok(Self { index: payload[0] })
    }
}

/// Moves the recipient to another radio channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelSet {
    pub channel: u8,
}

impl Message for ChannelSet {
    const COMMAND: Command = Command::ChannelSet;

    fn encode_payload(&self, bytes: &mut Vec<u8>) {
        bytes.push(self.channel);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, FrameError> {
        require(Self::COMMAND, payload, 1)?;
        Ok(Self {
            channel: payload[0],
        })
    }
}

/// Answer of an unassigned device to `DEVICE_ID_GET`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceIdResponse {
    pub identity: DeviceIdentity,
}

impl Message for DeviceIdResponse {
    const COMMAND: Command = Command::DeviceIdResponse;

    fn encode_payload(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(self.identity.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, FrameError> {
        require(Self::COMMAND, payload, IDENTITY_WIDTH)?;
        let identity = DeviceIdentity::from_slice(payload).ok_or(FrameError::Truncated {
            command: Self::COMMAND,
            size: payload.len(),
            min: IDENTITY_WIDTH,
        })?;
        Ok(Self { identity })
    }
}

/// Assignment of a node id to the device holding `identity`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EnumerateDevice {
    pub identity: DeviceIdentity,
    pub node_id: u8,
}

impl Message for EnumerateDevice {
    const COMMAND: Command = Command::EnumerateDevice;

    fn encode_payload(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(self.identity.as_bytes());
        bytes.push(self.node_id);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, FrameError> {
        require(Self::COMMAND, payload, IDENTITY_WIDTH + 1)?;
        let DeviceIdResponse { identity } = DeviceIdResponse::decode_payload(payload)?;
        Ok(Self {
            identity,
            node_id: payload[IDENTITY_WIDTH],
        })
    }
}

/// One packet of a bulk transfer: `[sequence, chunk...]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataPacket {
    pub sequence: u8,
    pub chunk: Vec<u8>,
}

impl DataPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.push(self.sequence);
        bytes.extend_from_slice(&self.chunk);
        bytes
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        match bytes.split_first() {
            Some((sequence, chunk)) => Ok(Self {
                sequence: *sequence,
                chunk: chunk.to_vec(),
            }),
            None => Err(FrameError::Empty),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum FrameError {
    #[error("Empty frame.")]
    Empty,

    #[error("Unknown command {0:#04x}.")]
    UnknownCommand(u8),

    #[error("Unexpected command (expected: {expected:?}, found: {found:#04x}).")]
    UnexpectedCommand { expected: Command, found: u8 },

    #[error("Payload too short for {command:?} (is: {size}B, min: {min}B).")]
    Truncated {
        command: Command,
        size: usize,
        min: usize,
    },

    #[error("Unexpected bytes after the {command:?} payload.")]
    Padding { command: Command },

    #[error("Frame is too big to be transmitted (is: {size}B, max: {max}B)!")]
    TooBigFrameError { size: usize, max: usize },
}

impl FrameSize for Frame {
    fn size(&self) -> usize {
        1 + self.payload.len()
    }
}

impl FrameSize for AckFrame {
    fn size(&self) -> usize {
        let mut size = 3;
        if self.timestamp.is_some() {
            size += 4;
        }
        if !self.payload.is_empty() {
            size += 1 + self.payload.len();
        }
        size
    }
}

impl FrameSize for DataPacket {
    fn size(&self) -> usize {
        1 + self.chunk.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_values_are_stable() {
        assert_eq!(u8::from(Command::Ack), 0);
        assert_eq!(u8::from(Command::DataStart), 4);
        assert_eq!(u8::from(Command::DeviceIdGet), 9);
        assert_eq!(u8::from(Command::AllPacketsReceived), 13);
        assert_eq!(Command::try_from(12), Ok(Command::ResendPacket));
        assert_eq!(Command::try_from(14), Err(FrameError::UnknownCommand(14)));
    }

    #[test]
    fn application_command_keeps_raw_byte() {
        let frame = Frame::new(0x61u8, vec![1, 2]);
        assert_eq!(frame.to_bytes(), vec![0x61, 1, 2]);
        assert_eq!(frame.kind(), None);
        assert_eq!(frame.size(), 3);
    }

    #[test]
    fn empty_packet_is_rejected() {
        assert_eq!(Frame::try_from_bytes(&[]), Err(FrameError::Empty));
        assert_eq!(DataPacket::try_from_bytes(&[]), Err(FrameError::Empty));
    }

    #[test]
    fn data_start_is_big_endian() {
        let frame = DataStart { total_size: 0x0164 }.to_frame();
        assert_eq!(frame.to_bytes(), vec![4, 0x01, 0x64]);
    }

    #[test]
    fn ack_survives_phy_padding() {
        let ack = AckFrame::new(Command::TimestampReq).with_timestamp(0xDEAD_BEEF);
        let mut bytes = ack.to_frame().to_bytes();
        assert_eq!(bytes.len(), ack.size());
        bytes.resize(32, 0);
        let decoded = AckFrame::try_from_frame(&Frame::try_from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, ack);
        assert!(decoded.matches(Command::TimestampReq as u8));
    }

    #[test]
    fn ack_with_echoed_payload() {
        let ack = AckFrame::new(0x61u8).with_payload(vec![9, 8, 7]);
        let decoded = AckFrame::try_from_frame(&ack.to_frame()).unwrap();
        assert_eq!(decoded.payload, vec![9, 8, 7]);
        assert_eq!(decoded.timestamp, None);
    }

    #[test]
    fn ack_with_missing_timestamp_is_truncated() {
        let frame = Frame::new(Command::Ack, vec![5, AckFlags::TIMESTAMP.bits(), 0]);
        assert!(matches!(
            AckFrame::try_from_frame(&frame),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn typed_decode_checks_command() {
        let frame = ResendPacket { index: 2 }.to_frame();
        assert_eq!(
            DataStart::try_from_frame(&frame),
            Err(FrameError::UnexpectedCommand {
                expected: Command::DataStart,
                found: Command::ResendPacket as u8,
            })
        );
        assert_eq!(ResendPacket::try_from_frame(&frame), Ok(ResendPacket { index: 2 }));
    }

    #[test]
    fn strict_decode_wants_zero_padding() {
        let mut bytes = ChannelSet { channel: 3 }.to_frame().to_bytes();
        bytes.resize(32, 0);
        let frame = Frame::try_from_bytes(&bytes).unwrap();
        assert_eq!(ChannelSet::try_from_padded_frame(&frame), Ok(ChannelSet { channel: 3 }));

        // Data packet 5 of a buffer full of 0x07.
        let mut bytes = vec![7u8; 32];
        bytes[0] = 5;
        let packet = Frame::try_from_bytes(&bytes).unwrap();
        assert_eq!(ChannelSet::try_from_frame(&packet), Ok(ChannelSet { channel: 7 }));
        assert_eq!(
            ChannelSet::try_from_padded_frame(&packet),
            Err(FrameError::Padding {
                command: Command::ChannelSet
            })
        );
    }

    #[test]
    fn strict_decode_rejects_noisy_ack() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&[7; 31]);
        let frame = Frame::try_from_bytes(&bytes).unwrap();
        assert!(AckFrame::try_from_frame(&frame).is_ok());
        assert!(AckFrame::try_from_padded_frame(&frame).is_err());

        let mut bytes = AckFrame::new(Command::TimestampReq).with_timestamp(9).to_frame().to_bytes();
        bytes.resize(32, 0);
        let frame = Frame::try_from_bytes(&bytes).unwrap();
        assert_eq!(AckFrame::try_from_padded_frame(&frame).unwrap().timestamp, Some(9));
    }

    #[test]
    fn padding_check() {
        let frame = Frame::new(Command::TimestampReq, vec![0, 0, 0]);
        assert!(frame.is_padded_from(0));
        assert!(!Frame::new(Command::TimestampReq, vec![0, 1]).is_padded_from(0));
        assert!(Frame::new(Command::ChannelSet, vec![4, 0]).is_padded_from(1));
    }

    #[test]
    fn enumerate_device_layout() {
        let identity = DeviceIdentity::new([1, 2, 3, 4, 5, 6, 7, 8]);
        let frame = EnumerateDevice { identity, node_id: 7 }.to_frame();
        assert_eq!(frame.to_bytes(), vec![11, 1, 2, 3, 4, 5, 6, 7, 8, 7]);
        let decoded = EnumerateDevice::try_from_frame(&frame).unwrap();
        assert_eq!(decoded.identity, identity);
        assert_eq!(decoded.node_id, 7);
    }

    #[test]
    fn oversized_frame_does_not_fit() {
        let frame = Frame::new(Command::Announce, vec![0; 32]);
        assert_eq!(
            frame.check_fits(32),
            Err(FrameError::TooBigFrameError { size: 33, max: 32 })
        );
        assert!(Frame::new(Command::Announce, vec![0; 31]).check_fits(32).is_ok());
    }
}
