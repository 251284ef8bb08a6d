//! # Arbor Broker
//!
//! **Internal runtime crate for Arbor. Use the `arbor` crate for the public
//! API.**
//!
//! The broker runtime: overlay transport and peer health (`overlay`,
//! `link`), message classification (`router`), the service switch and
//! module host (`service`, `module`), the life-cycle state machine and its
//! script runner (`state_machine`, `runat`), groups (`groups`), the PMI
//! exchange (`pmi`), the content/checkpoint registration contract
//! (`content`), heartbeat (`heartbeat`), coordinated shutdown (`shutdown`),
//! and the client handle (`client`).
//!
//! Everything runs on one cooperative event loop per broker; see
//! [`broker::Broker`].

// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::future_not_send)] // Single-threaded cooperative design

pub mod broker;
pub mod client;
pub mod content;
pub mod error;
pub mod events;
pub mod groups;
pub mod heartbeat;
pub mod join;
pub mod link;
pub mod module;
pub mod modules;
pub mod overlay;
pub mod pmi;
pub mod router;
pub mod runat;
pub mod service;
pub mod shutdown;
pub mod state_machine;
pub mod tcp;

pub use broker::{endpoint_name, Broker, BrokerControl};
pub use client::Client;
pub use error::{BrokerError, Result};
pub use module::{BrokerModule, ModuleContext, ModuleState};
pub use modules::mem_backing::MemBacking;
pub use overlay::{MonitorEvent, PeerRole, SubtreeStatus};
pub use state_machine::BrokerState;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::{endpoint_name, Broker, BrokerControl};
    pub use crate::client::Client;
    pub use crate::error::{BrokerError, Result};
    pub use crate::module::{BrokerModule, ModuleContext};
    pub use crate::state_machine::BrokerState;
    pub use arbor_core::config::BrokerConfig;
    pub use arbor_core::error::ErrorCode;
    pub use arbor_core::message::{Credential, Message, MsgKind};
    pub use bytes::Bytes;
}
