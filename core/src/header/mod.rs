//! On-disk structure codecs
//!
//! Pure parsers for everything the session reads before it trusts the
//! device: the GPT identity entry, the firmware string and the cartridge
//! image header.

mod firmware;
pub mod partition;
mod xci;

pub use firmware::parse_firmware_version;
pub use partition::{is_adapter_signature, PartitionEntry, ADAPTER_SIGNATURE};
pub use xci::{CapacityClass, CartridgeImageHeader, HEADER_MAGIC};
