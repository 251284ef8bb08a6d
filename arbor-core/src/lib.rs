//! Arbor Core
//!
//! This crate contains the runtime-agnostic kernel of the Arbor broker:
//! - Typed multi-frame messages with route-stack discipline (`message`)
//! - Bit-stable wire codec (`codec`)
//! - Ranked idsets with ranged text encoding (`idset`)
//! - k-ary overlay tree arithmetic (`kary`)
//! - Wire error kinds and kernel errors (`error`)
//! - Per-subsystem configuration (`config`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod codec;
pub mod config;
pub mod error;
pub mod idset;
pub mod kary;
pub mod message;

// A small prelude for downstream crates. Kept minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::codec::{decode_parts, encode_parts, FrameDecoder, MessageAssembler};
    pub use crate::config::BrokerConfig;
    pub use crate::error::{CoreError, ErrorCode};
    pub use crate::idset::IdSet;
    pub use crate::message::{Credential, Message, MsgKind};
}
