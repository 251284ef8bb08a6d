//! Typed multi-frame broker messages.
//!
//! A [`Message`] is the unit every broker subsystem exchanges: a kind tag, a
//! route stack of opaque peer identifiers, a dotted topic, a matchtag pairing
//! responses to requests, a credential, and optional structured / raw
//! payloads. Construction is fluent:
//!
//! ```
//! use arbor_core::message::Message;
//!
//! let msg = Message::request("groups.join")
//!     .with_matchtag(1)
//!     .with_payload(serde_json::json!({ "name": "broker.online" }));
//! assert_eq!(msg.topic(), "groups.join");
//! assert_eq!(msg.service(), "groups");
//! ```
//!
//! Route stacks follow the overlay discipline: the originator's identifier
//! sits at the bottom, each broker pushes its own identifier on forward and
//! pops it on return. Services treat the stack as opaque.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;

use crate::error::{CoreError, ErrorCode, Result};

/// Message kinds. Wire values are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgKind {
    Request = 1,
    Response = 2,
    Event = 4,
    Control = 8,
    Keepalive = 16,
}

impl MsgKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Control => "control",
            Self::Keepalive => "keepalive",
        }
    }

    /// Decode the wire type tag.
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            4 => Ok(Self::Event),
            8 => Ok(Self::Control),
            16 => Ok(Self::Keepalive),
            other => Err(CoreError::protocol(format!("unknown type tag {other}"))),
        }
    }
}

/// Role bits carried in the credential rolemask.
pub mod role {
    /// Instance owner: full access.
    pub const OWNER: u32 = 1;
    /// Unprivileged user: access to methods that opt in.
    pub const USER: u32 = 2;
}

/// Message credential: originating user and granted roles.
///
/// Credentials flow through the tree unmodified; the router never rewrites
/// them. Services consult them for per-method authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    pub userid: u32,
    pub rolemask: u32,
}

impl Credential {
    #[must_use]
    pub const fn new(userid: u32, rolemask: u32) -> Self {
        Self { userid, rolemask }
    }

    /// The broker's own credential.
    #[must_use]
    pub const fn owner(userid: u32) -> Self {
        Self { userid, rolemask: role::OWNER }
    }

    #[must_use]
    pub const fn has_role(&self, bits: u32) -> bool {
        self.rolemask & bits != 0
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self { userid: 0, rolemask: role::OWNER }
    }
}

/// Wire flag bits (16-bit field in the header frame).
pub mod flags {
    /// The request expects multiple responses terminated by an error frame.
    pub const STREAMING: u16 = 0x0001;
    /// The request expects no response at all.
    pub const NORESPONSE: u16 = 0x0002;
    /// The structured payload carries `{errnum, errstr}`.
    pub const ERROR: u16 = 0x0004;
    /// A structured-payload frame is present.
    pub const PAYLOAD: u16 = 0x0008;
    /// A raw-payload frame is present.
    pub const RAW: u16 = 0x0010;
}

/// Error carried by a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgError {
    pub code: ErrorCode,
    pub text: Option<String>,
}

impl MsgError {
    #[must_use]
    pub fn new(code: ErrorCode, text: Option<&str>) -> Self {
        Self { code, text: text.map(str::to_owned) }
    }
}

/// Route stack entries stay inline for typical tree depths.
pub type RouteStack = SmallVec<[Bytes; 4]>;

/// A typed multi-frame broker message.
#[derive(Debug, Clone)]
pub struct Message {
    kind: MsgKind,
    route: RouteStack,
    topic: String,
    matchtag: u32,
    cred: Credential,
    flags: u16,
    payload: Option<serde_json::Value>,
    raw: Option<Bytes>,
    error: Option<MsgError>,
}

impl Message {
    fn new(kind: MsgKind, topic: impl Into<String>) -> Self {
        Self {
            kind,
            route: SmallVec::new(),
            topic: topic.into(),
            matchtag: 0,
            cred: Credential::default(),
            flags: 0,
            payload: None,
            raw: None,
            error: None,
        }
    }

    /// Create a request for `topic` (`service.method`).
    #[must_use]
    pub fn request(topic: impl Into<String>) -> Self {
        Self::new(MsgKind::Request, topic)
    }

    /// Create an event for `topic`.
    #[must_use]
    pub fn event(topic: impl Into<String>) -> Self {
        Self::new(MsgKind::Event, topic)
    }

    /// Create a control message for `topic`.
    #[must_use]
    pub fn control(topic: impl Into<String>) -> Self {
        Self::new(MsgKind::Control, topic)
    }

    /// Create a keepalive. Carries no topic or payload.
    #[must_use]
    pub fn keepalive() -> Self {
        Self::new(MsgKind::Keepalive, "")
    }

    /// The module-channel EOF marker (encodes to zero frames).
    #[must_use]
    pub fn eof() -> Self {
        Self::new(MsgKind::Control, "")
    }

    /// Raw constructor used by the codec when rebuilding decoded messages.
    pub(crate) fn from_wire(kind: MsgKind, topic: &str) -> Self {
        Self::new(kind, topic)
    }

    /// Create a success response to `req`: same topic, matchtag, credential,
    /// and route stack.
    #[must_use]
    pub fn response_to(req: &Message) -> Self {
        Self {
            kind: MsgKind::Response,
            route: req.route.clone(),
            topic: req.topic.clone(),
            matchtag: req.matchtag,
            cred: req.cred,
            flags: 0,
            payload: None,
            raw: None,
            error: None,
        }
    }

    /// Create an error response to `req`.
    #[must_use]
    pub fn error_response_to(req: &Message, code: ErrorCode, text: Option<&str>) -> Self {
        let mut msg = Self::response_to(req);
        msg.flags |= flags::ERROR;
        msg.error = Some(MsgError::new(code, text));
        msg
    }

    // ------------------------------------------------------------------
    // Builder methods
    // ------------------------------------------------------------------

    #[must_use]
    pub fn with_matchtag(mut self, matchtag: u32) -> Self {
        self.matchtag = matchtag;
        self
    }

    #[must_use]
    pub fn with_cred(mut self, cred: Credential) -> Self {
        self.cred = cred;
        self
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Serialize `value` and attach it as the structured payload.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn with_payload_json<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Attach a raw byte payload.
    #[must_use]
    pub fn with_raw(mut self, raw: impl Into<Bytes>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    /// Mark the request as streaming.
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.flags |= flags::STREAMING;
        self
    }

    /// Mark the request as fire-and-forget.
    #[must_use]
    pub fn noresponse(mut self) -> Self {
        self.flags |= flags::NORESPONSE;
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub const fn kind(&self) -> MsgKind {
        self.kind
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// First dotted element of the topic: the service name.
    #[must_use]
    pub fn service(&self) -> &str {
        self.topic.split('.').next().unwrap_or("")
    }

    #[must_use]
    pub const fn matchtag(&self) -> u32 {
        self.matchtag
    }

    /// Events reuse the matchtag field as their root-assigned sequence.
    #[must_use]
    pub const fn seq(&self) -> u32 {
        self.matchtag
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.matchtag = seq;
    }

    #[must_use]
    pub const fn cred(&self) -> Credential {
        self.cred
    }

    #[must_use]
    pub const fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    /// Deserialize the structured payload.
    ///
    /// # Errors
    ///
    /// Fails with a protocol error if the payload is absent or does not
    /// match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| CoreError::protocol("missing structured payload"))?;
        Ok(serde_json::from_value(payload.clone())?)
    }

    #[must_use]
    pub const fn raw(&self) -> Option<&Bytes> {
        self.raw.as_ref()
    }

    #[must_use]
    pub const fn error(&self) -> Option<&MsgError> {
        self.error.as_ref()
    }

    #[must_use]
    pub const fn flags(&self) -> u16 {
        self.flags
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.flags & flags::STREAMING != 0
    }

    #[must_use]
    pub const fn is_noresponse(&self) -> bool {
        self.flags & flags::NORESPONSE != 0
    }

    /// True for the module-channel EOF marker.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self.kind, MsgKind::Control)
            && self.topic.is_empty()
            && self.payload.is_none()
            && self.raw.is_none()
    }

    // ------------------------------------------------------------------
    // Route stack
    // ------------------------------------------------------------------

    /// Push a peer identifier on top of the route stack.
    pub fn route_push(&mut self, id: Bytes) {
        self.route.push(id);
    }

    /// Pop the top route entry.
    pub fn route_pop(&mut self) -> Option<Bytes> {
        self.route.pop()
    }

    /// The identifier on top of the stack (most recent hop).
    #[must_use]
    pub fn route_top(&self) -> Option<&Bytes> {
        self.route.last()
    }

    /// The identifier at the bottom of the stack: the originator.
    #[must_use]
    pub fn sender(&self) -> Option<&Bytes> {
        self.route.first()
    }

    #[must_use]
    pub fn route_len(&self) -> usize {
        self.route.len()
    }

    #[must_use]
    pub fn route_contains(&self, id: &[u8]) -> bool {
        self.route.iter().any(|entry| entry.as_ref() == id)
    }

    #[must_use]
    pub fn route(&self) -> &[Bytes] {
        &self.route
    }

    pub(crate) fn set_route(&mut self, route: RouteStack) {
        self.route = route;
    }

    /// Response match predicate: matchtags equal and the top route entry
    /// identifies the local endpoint.
    #[must_use]
    pub fn matches(&self, matchtag: u32, local_id: &[u8]) -> bool {
        self.kind == MsgKind::Response
            && self.matchtag == matchtag
            && self.route_top().is_some_and(|top| top.as_ref() == local_id)
    }

    /// Disconnect match predicate: `other` was sent by the same endpoint and
    /// user as this cached request. Evaluated against the cached request
    /// exactly, never a route prefix.
    #[must_use]
    pub fn disconnect_match(&self, cached: &Message) -> bool {
        self.sender() == cached.sender() && self.cred.userid == cached.cred.userid
    }

    pub(crate) fn set_flags(&mut self, flags: u16) {
        self.flags = flags;
    }

    pub(crate) fn set_error(&mut self, error: MsgError) {
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_basics() {
        let msg = Message::request("content-backing.load")
            .with_matchtag(7)
            .with_raw(&b"digest"[..])
            .streaming();
        assert_eq!(msg.kind(), MsgKind::Request);
        assert_eq!(msg.service(), "content-backing");
        assert_eq!(msg.matchtag(), 7);
        assert!(msg.is_streaming());
        assert_eq!(msg.raw().unwrap().as_ref(), b"digest");
    }

    #[test]
    fn response_copies_envelope() {
        let mut req = Message::request("kvs-checkpoint.get")
            .with_matchtag(42)
            .with_cred(Credential::new(1000, role::USER));
        req.route_push(Bytes::from_static(b"client-1"));
        req.route_push(Bytes::from_static(b"broker-0"));

        let rsp = Message::response_to(&req);
        assert_eq!(rsp.kind(), MsgKind::Response);
        assert_eq!(rsp.matchtag(), 42);
        assert_eq!(rsp.cred().userid, 1000);
        assert_eq!(rsp.route_len(), 2);
        assert!(rsp.matches(42, b"broker-0"));
        assert!(!rsp.matches(42, b"client-1"));
        assert!(!rsp.matches(41, b"broker-0"));
    }

    #[test]
    fn error_response() {
        let req = Message::request("groups.get").with_matchtag(3);
        let rsp = Message::error_response_to(&req, ErrorCode::NotFound, Some("no such group"));
        let err = rsp.error().unwrap();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.text.as_deref(), Some("no such group"));
        assert_eq!(rsp.flags() & flags::ERROR, flags::ERROR);
    }

    #[test]
    fn route_discipline() {
        let mut msg = Message::request("a.b");
        msg.route_push(Bytes::from_static(b"origin"));
        msg.route_push(Bytes::from_static(b"hop1"));
        assert_eq!(msg.sender().unwrap().as_ref(), b"origin");
        assert_eq!(msg.route_top().unwrap().as_ref(), b"hop1");
        assert!(msg.route_contains(b"origin"));
        assert_eq!(msg.route_pop().unwrap().as_ref(), b"hop1");
        assert_eq!(msg.route_len(), 1);
    }

    #[test]
    fn payload_roundtrip() {
        let msg = Message::request("groups.join").with_payload(json!({"name": "x"}));
        #[derive(serde::Deserialize)]
        struct Join {
            name: String,
        }
        let join: Join = msg.payload_as().unwrap();
        assert_eq!(join.name, "x");
    }

    #[test]
    fn eof_marker() {
        assert!(Message::eof().is_eof());
        assert!(!Message::control("overlay.hello").is_eof());
        assert!(!Message::keepalive().is_eof());
    }

    #[test]
    fn disconnect_matching_is_exact() {
        let mut cached = Message::request("groups.join").with_cred(Credential::new(100, role::USER));
        cached.route_push(Bytes::from_static(b"client-a"));

        let mut disc = Message::request("groups.disconnect").with_cred(Credential::new(100, role::USER));
        disc.route_push(Bytes::from_static(b"client-a"));
        assert!(disc.disconnect_match(&cached));

        let mut other = Message::request("groups.disconnect").with_cred(Credential::new(100, role::USER));
        other.route_push(Bytes::from_static(b"client-b"));
        assert!(!other.disconnect_match(&cached));

        let mut wrong_user = Message::request("groups.disconnect").with_cred(Credential::new(101, role::USER));
        wrong_user.route_push(Bytes::from_static(b"client-a"));
        assert!(!wrong_user.disconnect_match(&cached));
    }
}
