//! KIS Real-Time Control Messages
//!
//! JSON frames exchanged on the real-time socket outside of tick data:
//! outbound subscribe requests and inbound acknowledgements / keepalives.
//!
//! # Subscribe Request
//!
//! ```json
//! {
//!   "header": {"approval_key": "...", "custtype": "P", "tr_type": "1", "content-type": "utf-8"},
//!   "body": {"input": {"tr_id": "H0IFCNT0", "tr_key": "101S03"}}
//! }
//! ```
//!
//! # Acknowledgement
//!
//! ```json
//! {
//!   "header": {"tr_id": "H0IFCNT0", "tr_key": "101S03", "encrypt": "N"},
//!   "body": {"rt_cd": "0", "msg_cd": "OPSP0000", "msg1": "SUBSCRIBE SUCCESS"}
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Message text of a successful subscription.
pub const SUBSCRIBE_SUCCESS: &str = "SUBSCRIBE SUCCESS";

/// Lowercased prefix of the rejection sent for an unknown or revoked
/// approval key (`"invalid approval : NOT FOUND"`).
pub const INVALID_APPROVAL: &str = "invalid approval";

/// `tr_id` of upstream keepalive frames, which must be echoed back.
pub const PINGPONG_TR_ID: &str = "PINGPONG";

/// `tr_type` registering a real-time subscription.
const TR_TYPE_REGISTER: &str = "1";

// =============================================================================
// Outbound
// =============================================================================

/// Subscribe request frame.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest<'a> {
    header: RequestHeader<'a>,
    body: RequestBody<'a>,
}

#[derive(Debug, Clone, Serialize)]
struct RequestHeader<'a> {
    approval_key: &'a str,
    custtype: &'a str,
    tr_type: &'static str,
    #[serde(rename = "content-type")]
    content_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct RequestBody<'a> {
    input: RequestInput<'a>,
}

#[derive(Debug, Clone, Serialize)]
struct RequestInput<'a> {
    tr_id: &'a str,
    tr_key: &'a str,
}

impl<'a> SubscribeRequest<'a> {
    /// Register `tr_key` on channel `tr_id`.
    #[must_use]
    pub const fn register(
        approval_key: &'a str,
        custtype: &'a str,
        tr_id: &'a str,
        tr_key: &'a str,
    ) -> Self {
        Self {
            header: RequestHeader {
                approval_key,
                custtype,
                tr_type: TR_TYPE_REGISTER,
                content_type: "utf-8",
            },
            body: RequestBody {
                input: RequestInput { tr_id, tr_key },
            },
        }
    }

    /// Serialize to the wire text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Inbound JSON control frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlMessage {
    /// Frame header.
    pub header: ControlHeader,
    /// Frame body, absent on keepalives.
    #[serde(default)]
    pub body: Option<ControlBody>,
}

/// Control frame header.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlHeader {
    /// Channel or `PINGPONG`.
    #[serde(default)]
    pub tr_id: String,
    /// Instrument the frame answers for.
    #[serde(default)]
    pub tr_key: Option<String>,
}

/// Control frame body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlBody {
    /// Result code, `"0"` on success.
    #[serde(default)]
    pub rt_cd: Option<String>,
    /// Message code.
    #[serde(default)]
    pub msg_cd: Option<String>,
    /// Message text.
    #[serde(default)]
    pub msg1: Option<String>,
}

/// How the upstream answered a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Subscription registered.
    Success,
    /// Anything else, carrying the upstream message.
    Rejected(String),
}

impl AckOutcome {
    /// Whether the broker refused the approval key itself rather than the
    /// instrument.
    #[must_use]
    pub fn is_invalid_approval(&self) -> bool {
        match self {
            Self::Success => false,
            Self::Rejected(message) => message.to_ascii_lowercase().starts_with(INVALID_APPROVAL),
        }
    }
}

impl ControlMessage {
    /// Parse a control frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a control frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Whether this is an upstream keepalive.
    #[must_use]
    pub fn is_pingpong(&self) -> bool {
        self.header.tr_id == PINGPONG_TR_ID
    }

    /// The instrument key and outcome if this frame answers a subscribe.
    #[must_use]
    pub fn ack(&self) -> Option<(&str, AckOutcome)> {
        let key = self.header.tr_key.as_deref()?;
        let message = self.body.as_ref()?.msg1.as_deref()?;
        let outcome = if message == SUBSCRIBE_SUCCESS {
            AckOutcome::Success
        } else {
            AckOutcome::Rejected(message.to_string())
        };
        Some((key, outcome))
    }
}
