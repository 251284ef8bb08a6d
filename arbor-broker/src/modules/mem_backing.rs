//! Process-local backing store module.
//!
//! Implements the content and checkpoint contracts over in-memory maps:
//! blobs addressed by their SHA-256 digest, checkpoint values by key. Real
//! deployments put a durable store behind the same topics; this module
//! exists so a session has a working backing without one, and so the
//! contract has an in-tree exerciser.
//!
//! On startup it claims the `content-backing` and `kvs-checkpoint` service
//! names, then registers as the broker's backing store. Registration
//! replies share the inbox with request traffic; they are matched by
//! matchtag and only logged.

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use arbor_core::error::ErrorCode;
use arbor_core::message::{Message, MsgKind};

use crate::content::{BACKING_SERVICE, CHECKPOINT_SERVICE};
use crate::error::Result;
use crate::module::{BrokerModule, ModuleContext};

/// Default module name, also the registered backing-store name.
pub const MEM_BACKING_NAME: &str = "mem-backing";

/// In-memory implementor of the backing contract.
#[derive(Default)]
pub struct MemBacking {
    blobs: HashMap<Vec<u8>, Bytes>,
    checkpoints: HashMap<String, serde_json::Value>,
}

impl MemBacking {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn load(&self, ctx: &ModuleContext, msg: &Message) -> Result<()> {
        let Some(digest) = msg.raw() else {
            return ctx.respond_err(msg, ErrorCode::Protocol, "load needs a digest");
        };
        match self.blobs.get(digest.as_ref()) {
            Some(blob) => ctx.respond_raw(msg, blob.clone()),
            None => ctx.respond_err(msg, ErrorCode::NotFound, "no blob with that digest"),
        }
    }

    fn store(&mut self, ctx: &ModuleContext, msg: &Message) -> Result<()> {
        let Some(blob) = msg.raw() else {
            return ctx.respond_err(msg, ErrorCode::Protocol, "store needs blob bytes");
        };
        let digest = Sha256::digest(blob).to_vec();
        debug!(bytes = blob.len(), "mem-backing: store");
        self.blobs.insert(digest.clone(), blob.clone());
        ctx.respond_raw(msg, Bytes::from(digest))
    }

    fn checkpoint_get(&self, ctx: &ModuleContext, msg: &Message) -> Result<()> {
        let Some(key) = msg
            .payload()
            .and_then(|p| p.get("key"))
            .and_then(serde_json::Value::as_str)
        else {
            return ctx.respond_err(msg, ErrorCode::Protocol, "get needs a key");
        };
        match self.checkpoints.get(key) {
            // Legacy stores held a bare rootref string; present it in the
            // structured form.
            Some(serde_json::Value::String(rootref)) => ctx.respond_ok(
                msg,
                Some(json!({
                    "value": { "version": 0, "rootref": rootref, "timestamp": 0 }
                })),
            ),
            Some(value) => ctx.respond_ok(msg, Some(json!({ "value": value }))),
            None => ctx.respond_err(msg, ErrorCode::NotFound, "no checkpoint with that key"),
        }
    }

    fn checkpoint_put(&mut self, ctx: &ModuleContext, msg: &Message) -> Result<()> {
        let (Some(key), Some(value)) = (
            msg.payload()
                .and_then(|p| p.get("key"))
                .and_then(serde_json::Value::as_str),
            msg.payload().and_then(|p| p.get("value")),
        ) else {
            return ctx.respond_err(msg, ErrorCode::Protocol, "put needs a key and a value");
        };
        self.checkpoints.insert(key.to_owned(), value.clone());
        ctx.respond_ok(msg, None)
    }

    fn handle_request(&mut self, ctx: &ModuleContext, msg: &Message) -> Result<()> {
        match msg.topic() {
            "content-backing.load" => self.load(ctx, msg),
            "content-backing.store" => self.store(ctx, msg),
            "kvs-checkpoint.get" => self.checkpoint_get(ctx, msg),
            "kvs-checkpoint.put" => self.checkpoint_put(ctx, msg),
            other => ctx.respond_err(
                msg,
                ErrorCode::MethodNotFound,
                &format!("unknown method '{other}'"),
            ),
        }
    }
}

#[async_trait]
impl BrokerModule for MemBacking {
    fn name(&self) -> &str {
        MEM_BACKING_NAME
    }

    async fn run(mut self: Box<Self>, ctx: ModuleContext) -> Result<()> {
        ctx.request("service.add", Some(json!({ "name": BACKING_SERVICE })))?;
        ctx.request("service.add", Some(json!({ "name": CHECKPOINT_SERVICE })))?;
        ctx.request(
            "content.register-backing",
            Some(json!({ "name": MEM_BACKING_NAME })),
        )?;

        while let Some(msg) = ctx.recv().await {
            match msg.kind() {
                MsgKind::Request => self.handle_request(&ctx, &msg)?,
                MsgKind::Response => {
                    if let Some(err) = msg.error() {
                        warn!(topic = %msg.topic(), code = %err.code, "mem-backing: registration failed");
                    }
                }
                _ => {}
            }
        }
        ctx.send_eof();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> (ModuleContext, flume::Sender<Message>, flume::Receiver<Message>) {
        let (in_tx, in_rx) = flume::unbounded();
        let (out_tx, out_rx) = flume::unbounded();
        let ctx = ModuleContext::new(
            std::sync::Arc::from(MEM_BACKING_NAME),
            Bytes::from_static(b"backing-uuid"),
            0,
            1,
            in_rx,
            out_tx,
        );
        (ctx, in_tx, out_rx)
    }

    fn request(topic: &str) -> Message {
        let mut msg = Message::request(topic).with_matchtag(1);
        msg.route_push(Bytes::from_static(b"client"));
        msg.route_push(Bytes::from_static(b"broker"));
        msg
    }

    #[test]
    fn store_then_load_roundtrip() {
        let (ctx, _in_tx, out_rx) = test_ctx();
        let mut backing = MemBacking::new();

        let store = request("content-backing.store").with_raw(&b"hello"[..]);
        backing.handle_request(&ctx, &store).unwrap();
        let digest = out_rx.try_recv().unwrap().raw().unwrap().clone();
        assert_eq!(digest.len(), 32);

        let load = request("content-backing.load").with_raw(digest);
        backing.handle_request(&ctx, &load).unwrap();
        let blob = out_rx.try_recv().unwrap();
        assert_eq!(blob.raw().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn load_unknown_digest_not_found() {
        let (ctx, _in_tx, out_rx) = test_ctx();
        let mut backing = MemBacking::new();
        let load = request("content-backing.load").with_raw(Bytes::from(vec![0u8; 32]));
        backing.handle_request(&ctx, &load).unwrap();
        let rsp = out_rx.try_recv().unwrap();
        assert_eq!(rsp.error().unwrap().code, ErrorCode::NotFound);
    }

    #[test]
    fn checkpoint_roundtrip() {
        let (ctx, _in_tx, out_rx) = test_ctx();
        let mut backing = MemBacking::new();

        let put = request("kvs-checkpoint.put")
            .with_payload(json!({ "key": "primary", "value": { "rootref": "abc", "version": 1 } }));
        backing.handle_request(&ctx, &put).unwrap();
        assert!(out_rx.try_recv().unwrap().error().is_none());

        let get = request("kvs-checkpoint.get").with_payload(json!({ "key": "primary" }));
        backing.handle_request(&ctx, &get).unwrap();
        let rsp = out_rx.try_recv().unwrap();
        assert_eq!(rsp.payload().unwrap()["value"]["rootref"], "abc");
    }

    #[test]
    fn legacy_string_checkpoint_wrapped() {
        let (ctx, _in_tx, out_rx) = test_ctx();
        let mut backing = MemBacking::new();

        let put = request("kvs-checkpoint.put")
            .with_payload(json!({ "key": "primary", "value": "bare-rootref" }));
        backing.handle_request(&ctx, &put).unwrap();
        out_rx.try_recv().unwrap();

        let get = request("kvs-checkpoint.get").with_payload(json!({ "key": "primary" }));
        backing.handle_request(&ctx, &get).unwrap();
        let rsp = out_rx.try_recv().unwrap();
        let value = &rsp.payload().unwrap()["value"];
        assert_eq!(value["rootref"], "bare-rootref");
        assert_eq!(value["version"], 0);
        assert_eq!(value["timestamp"], 0);
    }
}
