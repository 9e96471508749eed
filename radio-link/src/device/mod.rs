//! Everything needed to move packets using the physical radio module.

pub mod device;
pub mod radio;
pub mod sim;

pub use device::*;
