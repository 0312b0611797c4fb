//! The envelope exchanged over the socket.
//!
//! Every frame on the wire, call or reply, carries one [`Envelope`]:
//!
//! | field     | default | notes                                   |
//! |-----------|---------|-----------------------------------------|
//! | `id`      | `""`    | unique per call, echoed by the reply    |
//! | `status`  | `200`   | see [`status`]                          |
//! | `message` | `""`    | human readable                          |
//! | `key`     | `""`    | dot-path of a handler; blank ⇒ reply    |
//! | `request` | `""`    | opaque payload                          |
//! | `params`  | `{}`    | side-channel metadata                   |
//!
//! # Example
//!
//! ```
//! use simplerpc::Envelope;
//!
//! let call = Envelope::call("math.add", serde_json::json!([1, 2]));
//! assert!(!call.id().is_empty());
//! assert!(!call.is_reply());
//!
//! let reply = Envelope::success("ok").with_id(call.id());
//! assert!(reply.is_reply());
//! assert_eq!(reply.id(), call.id());
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved status codes.
pub mod status {
    /// Success.
    pub const OK: u16 = 200;
    /// No handler registered for the key.
    pub const NOT_FOUND: u16 = 404;
    /// No reply arrived before the correlation timeout.
    pub const TIMEOUT: u16 = 408;
    /// Generic error.
    pub const ERROR: u16 = 500;
}

/// Message used for synthesized 404 replies.
pub const NOT_FOUND_MESSAGE: &str = "No matching APIs found";

/// Message used for synthesized 408 notifications.
pub const TIMEOUT_MESSAGE: &str = "Request timeout";

/// Side-channel metadata map.
pub type Params = HashMap<String, Value>;

/// Wire message for both calls and replies.
///
/// The `id` is private: once assigned it can only be replaced by the
/// consuming builders [`with_id`](Self::with_id) and
/// [`with_new_id`](Self::with_new_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    #[serde(alias = "UUID")]
    id: String,
    /// Status code, 200 unless one of the [`status`] error codes.
    pub status: u16,
    /// Human-readable message.
    pub message: String,
    /// Handler path. Blank for replies.
    pub key: String,
    /// Opaque payload.
    pub request: Value,
    /// Side-channel metadata.
    pub params: Params,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            id: String::new(),
            status: status::OK,
            message: String::new(),
            key: String::new(),
            request: Value::String(String::new()),
            params: Params::new(),
        }
    }
}

impl Envelope {
    /// Create an envelope with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Status 200 with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self::with_status(status::OK, message)
    }

    /// Status 500 with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(status::ERROR, message)
    }

    /// Status 404 with the given message.
    pub fn error404(message: impl Into<String>) -> Self {
        Self::with_status(status::NOT_FOUND, message)
    }

    /// Local 408 notification for a call that was never answered.
    pub fn timeout(id: impl Into<String>) -> Self {
        Self::with_status(status::TIMEOUT, TIMEOUT_MESSAGE).with_id(id)
    }

    /// A named call to `key` with a fresh id.
    pub fn call(key: impl Into<String>, request: Value) -> Self {
        let mut envelope = Self::new().with_new_id().with_request(request);
        envelope.key = key.into();
        envelope
    }

    fn with_status(code: u16, message: impl Into<String>) -> Self {
        Self {
            status: code,
            message: message.into(),
            ..Self::default()
        }
    }

    /// Generate a fresh unique identifier.
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Replace the id (explicit override).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the id with a freshly generated one.
    pub fn with_new_id(self) -> Self {
        self.with_id(Self::new_id())
    }

    /// Attach a payload.
    pub fn with_request(mut self, request: Value) -> Self {
        self.request = request;
        self
    }

    /// Attach side-channel params.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Set the handler path.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// The call id.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// A blank key marks a reply, correlated by id rather than routed by path.
    #[inline]
    pub fn is_reply(&self) -> bool {
        self.key.trim().is_empty()
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == status::OK
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        self.status == status::TIMEOUT
    }
}
