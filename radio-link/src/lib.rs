//! Node-to-node delivery over a half-duplex packet radio.
//!
//! A [Link] owns a [Device](device::Device) and offers reliable single-frame
//! delivery with acknowledgement, bulk transfers of up to
//! [MAX_TRANSFER_PACKETS](config::MAX_TRANSFER_PACKETS) packets with selective
//! resend, and the enumeration protocol giving node ids to unassigned devices.
pub mod address;
pub mod bulk;
pub mod config;
pub mod device;
pub mod enumeration;
pub mod error;
pub mod frame;
pub mod link;

pub use address::{make_address, DeviceIdentity, Node, PhysicalAddress};
pub use bulk::{TransferSession, TransferStatus};
pub use config::{EnumerationParams, LinkConfig, TransferParams, MAX_RETRIES, MAX_TRANSFER_PACKETS};
pub use enumeration::EnumerationRegistry;
pub use error::LinkError;
pub use frame::{Command, Frame};
pub use link::{Link, Served};
