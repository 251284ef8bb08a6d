//! # Arbor
//!
//! A tree-overlay message broker core: the per-node substrate on which
//! resource-manager services (scheduler, KVS, job management) are composed.
//!
//! ## Architecture
//!
//! Arbor is structured in clean layers:
//!
//! - **`arbor-core`**: runtime-agnostic message model, wire codec, rank
//!   idsets and overlay tree math
//! - **`arbor-broker`**: the broker runtime — overlay transport, router,
//!   service switch, module host, life-cycle state machine, groups, PMI
//!   exchange, content contract
//! - **`arbor`**: public API surface (this crate)
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use arbor::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! // A single-rank session with an in-memory backing store.
//! let mut broker = Broker::new(BrokerConfig::new(0, 1).with_session("demo"));
//! broker.load_module(Box::new(arbor::MemBacking::new()));
//! let endpoint = broker.endpoint();
//! compio::runtime::spawn(broker.run()).detach();
//!
//! let client = Client::connect(&endpoint)?;
//! let digest = client.request_raw("content-backing.store", &b"hello"[..]).await?;
//! let blob = client
//!     .request_raw("content-backing.load", digest.raw().unwrap().clone())
//!     .await?;
//! assert_eq!(blob.raw().unwrap().as_ref(), b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - **Route stacks**: responses retrace their request's path exactly
//! - **Groups**: join acknowledged before membership propagates; rank 0
//!   converges on the union of live brokers' memberships
//! - **Single-threaded cooperative**: one event loop per broker, no locks
//!   on core state
//! - **Cooperative shutdown**: streaming RPCs always terminate with an
//!   error frame, never a silent close

#![warn(missing_docs)]

pub use arbor_broker::{
    endpoint_name, Broker, BrokerControl, BrokerError, BrokerModule, BrokerState, Client,
    MemBacking, ModuleContext, ModuleState, MonitorEvent, PeerRole, Result, SubtreeStatus,
};
pub use arbor_core::codec;
pub use arbor_core::config::BrokerConfig;
pub use arbor_core::error::ErrorCode;
pub use arbor_core::idset::IdSet;
pub use arbor_core::kary;
pub use arbor_core::message::{Credential, Message, MsgKind};

pub mod dev_tracing;

/// Prelude module for convenient imports
///
/// ```rust
/// use arbor::prelude::*;
/// ```
pub mod prelude {
    pub use crate::dev_tracing;
    pub use arbor_broker::prelude::*;
}
