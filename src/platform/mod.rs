//! Platform abstraction: mount table, block-device enumeration, transport
//! classification.

pub mod pal;
