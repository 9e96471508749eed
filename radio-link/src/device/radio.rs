use embedded_hal::blocking::delay::DelayMs;
use radio::{Receive, State, Transmit};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::Duration;

use log::{debug, trace};

use super::device::Device;
use crate::address::{PhysicalAddress, ADDRESS_WIDTH, DEFAULT_ADDRESS};

/// Packet size used when the transceiver does not impose one.
pub const DEFAULT_PAYLOAD_SIZE: usize = 32;
const MAX_AIR_PACKET: usize = 256;
const MAX_TRANSMIT_POLLS: usize = 100; // A poll = 1ms wait

/// Radio physical device representation, any transceiver implementing the `radio`
/// HAL traits.
pub trait Radio<C, S, E>:
    Transmit<Error = E>
    + Receive<Error = E>
    + radio::Channel<Channel = C, Error = E>
    + State<State = S, Error = E>
    + DelayMs<u32>
{
}

impl<
        C: Debug,
        S: Debug,
        E: Debug,
        T: Transmit<Error = E>
            + Receive<Error = E>
            + radio::Channel<Channel = C, Error = E>
            + State<State = S, Error = E>
            + DelayMs<u32>,
    > Radio<C, S, E> for T
{
}

/// [Device] implementation over a `radio` HAL transceiver.
///
/// Node channels index the `channels` table. Transceivers driven through the HAL
/// have no hardware address matching, so the physical address is sent as a prefix
/// of each packet and filtered on reception.
pub struct RadioDevice<'a, T, C, S, E>
where
    T: Radio<C, S, E>,
    C: Debug,
    S: Clone + Debug,
    E: Debug,
{
    radio: T,
    channels: &'a [C],
    standby_state: S,
    address: PhysicalAddress,
    channel: Option<u8>,
    receiving: bool,
    pending: bool,
    payload_size: usize,
    poll_interval: u32,
    phantom: PhantomData<E>,
}

impl<'a, T, C, S, E> RadioDevice<'a, T, C, S, E>
where
    T: Radio<C, S, E>,
    C: Debug,
    S: Clone + Debug,
    E: Debug,
{
    /// Wraps a radio. `standby_state` is the state set by [Device::standby].
    pub fn new(radio: T, channels: &'a [C], standby_state: S) -> Self {
        assert!(!channels.is_empty(), "No channel declared!");
        Self {
            radio,
            channels,
            standby_state,
            address: DEFAULT_ADDRESS,
            channel: None,
            receiving: false,
            pending: false,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            poll_interval: 1,
            phantom: PhantomData,
        }
    }

    /// Packet size, the on-air packet adds the address prefix to it.
    pub fn with_payload_size(mut self, payload_size: usize) -> Self {
        assert!(
            payload_size > 0 && payload_size + ADDRESS_WIDTH <= MAX_AIR_PACKET,
            "Payload size out of range!"
        );
        self.payload_size = payload_size;
        self
    }

    /// Interval between two polls of the radio while waiting, in ms.
    pub fn with_poll_interval(mut self, poll_interval: u32) -> Self {
        self.poll_interval = poll_interval.max(1);
        self
    }

    pub fn into_inner(self) -> T {
        self.radio
    }

    fn start_reception(&mut self) -> Result<(), RadioError<E>> {
        if !self.receiving {
            self.radio
                .start_receive()
                .map_err(RadioError::InternalRadioError)?;
            self.receiving = true;
        }
        Ok(())
    }

    fn check_reception(&mut self) -> Result<bool, RadioError<E>> {
        if !self.pending {
            self.pending = self
                .radio
                .check_receive(true)
                .map_err(RadioError::InternalRadioError)?;
        }
        Ok(self.pending)
    }
}

impl<'a, T, C, S, E> DelayMs<u32> for RadioDevice<'a, T, C, S, E>
where
    T: Radio<C, S, E>,
    C: Debug,
    S: Clone + Debug,
    E: Debug,
{
    fn delay_ms(&mut self, ms: u32) {
        self.radio.delay_ms(ms);
    }
}

impl<'a, T, C, S, E> Device for RadioDevice<'a, T, C, S, E>
where
    T: Radio<C, S, E>,
    C: Debug,
    S: Clone + Debug,
    E: Debug,
{
    type Error = RadioError<E>;

    fn payload_size(&self) -> usize {
        self.payload_size
    }

    fn configure(&mut self, address: PhysicalAddress, channel: u8) -> Result<(), Self::Error> {
        if self.channel != Some(channel) {
            let radio_channel = self
                .channels
                .get(channel as usize)
                .ok_or(RadioError::UnknownChannel { channel })?;
            debug!("Programming radio channel {} ({:?})", channel, radio_channel);
            self.radio
                .set_channel(radio_channel)
                .map_err(RadioError::InternalRadioError)?;
            self.channel = Some(channel);
            self.receiving = false;
            self.pending = false;
        }
        self.address = address;
        Ok(())
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<usize, Self::Error> {
        let mut buf = Vec::with_capacity(ADDRESS_WIDTH + self.payload_size);
        buf.extend_from_slice(self.address.as_bytes());
        let len = packet.len().min(self.payload_size);
        buf.extend_from_slice(&packet[..len]);
        buf.resize(ADDRESS_WIDTH + self.payload_size, 0);
        self.receiving = false;
        self.pending = false;
        trace!("Transmission on air to {}", self.address);
        self.radio
            .start_transmit(&buf)
            .map_err(RadioError::InternalRadioError)?;
        let mut polls = 0;
        while !self
            .radio
            .check_transmit()
            .map_err(RadioError::InternalRadioError)?
        {
            if polls >= MAX_TRANSMIT_POLLS {
                return Err(RadioError::TransmitTimeout);
            }
            self.radio.delay_ms(1);
            polls += 1;
        }
        Ok(self.payload_size)
    }

    fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, Self::Error> {
        let deadline = self.now() + timeout;
        self.start_reception()?;
        let mut air = [0u8; MAX_AIR_PACKET];
        loop {
            if self.check_reception()? {
                self.pending = false;
                let (size, _info) = self
                    .radio
                    .get_received(&mut air)
                    .map_err(RadioError::InternalRadioError)?;
                if size > ADDRESS_WIDTH && air[..ADDRESS_WIDTH] == self.address.0[..] {
                    let len = (size - ADDRESS_WIDTH).min(buffer.len());
                    buffer[..len].copy_from_slice(&air[ADDRESS_WIDTH..ADDRESS_WIDTH + len]);
                    return Ok(len);
                }
                trace!("Packet ignored: not addressed to {}", self.address);
                continue;
            }
            if self.now() >= deadline {
                return Ok(0);
            }
            self.radio.delay_ms(self.poll_interval);
        }
    }

    fn ready(&mut self) -> Result<bool, Self::Error> {
        if !self.receiving {
            return Ok(self.pending);
        }
        self.check_reception()
    }

    fn standby(&mut self) -> Result<(), Self::Error> {
        self.radio
            .set_state(self.standby_state.clone())
            .map_err(RadioError::InternalRadioError)?;
        self.receiving = false;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RadioError<R>
where
    R: Debug,
{
    #[error("No radio channel declared for channel {channel}.")]
    UnknownChannel { channel: u8 },

    #[error("Transmission did not complete in time.")]
    TransmitTimeout,

    #[error("Internal radio error.")]
    InternalRadioError(/*#[source]*/ R),
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use radio::{BasicInfo, RadioState};

    use super::*;
    use crate::address::make_address;

    #[derive(Debug)]
    struct MockError;

    #[derive(Clone, Debug, PartialEq)]
    enum MockState {
        Idle,
        Sleep,
    }

    impl RadioState for MockState {
        fn idle() -> Self {
            MockState::Idle
        }

        fn sleep() -> Self {
            MockState::Sleep
        }
    }

    /// Transceiver recording what the device asks of it.
    #[derive(Debug)]
    struct MockRadio {
        channel: Option<u32>,
        channel_changes: usize,
        state: MockState,
        listening: bool,
        incoming: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        stuck: bool,
        delays: u32,
    }

    impl MockRadio {
        fn new() -> Self {
            Self {
                channel: None,
                channel_changes: 0,
                state: MockState::Idle,
                listening: false,
                incoming: VecDeque::new(),
                sent: Vec::new(),
                stuck: false,
                delays: 0,
            }
        }

        fn with_incoming(mut self, address: PhysicalAddress, payload: &[u8]) -> Self {
            let mut packet = address.as_bytes().to_vec();
            packet.extend_from_slice(payload);
            self.incoming.push_back(packet);
            self
        }
    }

    impl Transmit for MockRadio {
        type Error = MockError;

        fn start_transmit(&mut self, data: &[u8]) -> Result<(), Self::Error> {
            self.listening = false;
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn check_transmit(&mut self) -> Result<bool, Self::Error> {
            Ok(!self.stuck)
        }
    }

    impl Receive for MockRadio {
        type Error = MockError;
        type Info = BasicInfo;

        fn start_receive(&mut self) -> Result<(), Self::Error> {
            self.listening = true;
            Ok(())
        }

        fn check_receive(&mut self, _restart: bool) -> Result<bool, Self::Error> {
            Ok(self.listening && !self.incoming.is_empty())
        }

        fn get_received(&mut self, buff: &mut [u8]) -> Result<(usize, Self::Info), Self::Error> {
            let packet = self.incoming.pop_front().ok_or(MockError)?;
            buff[..packet.len()].copy_from_slice(&packet);
            Ok((packet.len(), BasicInfo::default()))
        }
    }

    impl radio::Channel for MockRadio {
        type Channel = u32;
        type Error = MockError;

        fn set_channel(&mut self, channel: &Self::Channel) -> Result<(), Self::Error> {
            self.channel = Some(*channel);
            self.channel_changes += 1;
            Ok(())
        }
    }

    impl State for MockRadio {
        type State = MockState;
        type Error = MockError;

        fn set_state(&mut self, state: Self::State) -> Result<(), Self::Error> {
            self.state = state;
            Ok(())
        }

        fn get_state(&mut self) -> Result<Self::State, Self::Error> {
            Ok(self.state.clone())
        }
    }

    impl DelayMs<u32> for MockRadio {
        fn delay_ms(&mut self, ms: u32) {
            self.delays += ms;
        }
    }

    const CHANNELS: [u32; 2] = [868_100_000, 868_300_000];

    #[test]
    fn channel_index_selects_table_entry() {
        let mut device = RadioDevice::new(MockRadio::new(), &CHANNELS, MockState::Sleep);
        device.configure(make_address(1), 1).unwrap();
        device.configure(make_address(2), 1).unwrap();
        let radio = device.into_inner();
        assert_eq!(radio.channel, Some(868_300_000));
        assert_eq!(radio.channel_changes, 1);
    }

    #[test]
    fn unknown_channel_is_refused() {
        let mut device = RadioDevice::new(MockRadio::new(), &CHANNELS, MockState::Sleep);
        assert!(matches!(
            device.configure(make_address(1), 2),
            Err(RadioError::UnknownChannel { channel: 2 })
        ));
        assert_eq!(device.into_inner().channel_changes, 0);
    }

    #[test]
    fn transmit_prefixes_address_and_pads() {
        let address = make_address(3);
        let mut device = RadioDevice::new(MockRadio::new(), &CHANNELS, MockState::Sleep).with_payload_size(8);
        device.configure(address, 0).unwrap();
        assert_eq!(device.transmit(&[1, 2]).unwrap(), 8);

        let radio = device.into_inner();
        let mut expected = address.as_bytes().to_vec();
        expected.extend_from_slice(&[1, 2, 0, 0, 0, 0, 0, 0]);
        assert_eq!(radio.sent, vec![expected]);
    }

    #[test]
    fn transmit_gives_up_after_poll_bound() {
        let mut radio = MockRadio::new();
        radio.stuck = true;
        let mut device = RadioDevice::new(radio, &CHANNELS, MockState::Sleep);
        device.configure(make_address(1), 0).unwrap();
        assert!(matches!(device.transmit(&[1]), Err(RadioError::TransmitTimeout)));
        assert_eq!(device.into_inner().delays, MAX_TRANSMIT_POLLS as u32);
    }

    #[test]
    fn receive_filters_on_address() {
        let own = make_address(4);
        let radio = MockRadio::new()
            .with_incoming(make_address(5), &[9, 9])
            .with_incoming(own, &[1, 2, 3])
            .with_incoming(own, &[4]);
        let mut device = RadioDevice::new(radio, &CHANNELS, MockState::Sleep);
        device.configure(own, 0).unwrap();
        assert!(!device.ready().unwrap());

        let mut buf = [0u8; 8];
        assert_eq!(device.receive(&mut buf, Duration::ZERO).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert!(device.ready().unwrap());
        assert_eq!(device.receive(&mut buf, Duration::ZERO).unwrap(), 1);
        assert!(!device.ready().unwrap());
        assert_eq!(device.receive(&mut buf, Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn standby_sets_configured_state() {
        let mut radio = MockRadio::new();
        radio.state = MockState::idle();
        let mut device = RadioDevice::new(radio, &CHANNELS, MockState::sleep());
        device.standby().unwrap();
        assert_eq!(device.into_inner().state, MockState::Sleep);
    }
}
