//! Small shared building blocks: wire encoding and address packing.

pub mod encoding;
pub mod ip;

pub use ip::{pack_ipv4, unpack_ipv4};
