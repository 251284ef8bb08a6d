//! The builtin connector module.
//!
//! Owns the broker's accept side: the bound endpoint where local clients
//! and child brokers connect. Each accepted connection is handed to the
//! broker loop as a peer. Unloading the connector (the exit state does
//! this) unbinds the endpoint, so no new peers can arrive while the broker
//! drains.

use async_trait::async_trait;
use flume::{Receiver, Sender};
use futures::FutureExt;
use tracing::debug;

use crate::broker::BrokerEvent;
use crate::error::Result;
use crate::link::{self, LinkConnect};
use crate::module::{BrokerModule, ModuleContext};

pub(crate) const CONNECTOR_NAME: &str = "connector-local";

pub(crate) struct Connector {
    endpoint: String,
    accepts: Receiver<LinkConnect>,
    inbox: Sender<BrokerEvent>,
}

impl Connector {
    /// Bind the endpoint immediately so peers can connect before the module
    /// task is scheduled.
    pub(crate) fn new(endpoint: String, inbox: Sender<BrokerEvent>) -> std::io::Result<Self> {
        let accepts = link::bind(&endpoint)?;
        Ok(Self { endpoint, accepts, inbox })
    }
}

#[async_trait]
impl BrokerModule for Connector {
    fn name(&self) -> &str {
        CONNECTOR_NAME
    }

    async fn run(self: Box<Self>, ctx: ModuleContext) -> Result<()> {
        let Connector { endpoint, accepts, inbox } = *self;
        loop {
            futures::select! {
                conn = accepts.recv_async().fuse() => match conn {
                    Ok(conn) => {
                        if inbox.send(BrokerEvent::PeerConnected(conn)).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                msg = ctx.inbox().recv_async().fuse() => {
                    // The inbox carries nothing but the EOF request.
                    match msg {
                        Ok(msg) if msg.is_eof() => break,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            }
        }
        debug!(endpoint = %endpoint, "connector: unbinding");
        link::unbind(&endpoint);
        ctx.send_eof();
        Ok(())
    }
}
