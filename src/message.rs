//! Captured message record

use crate::mime::Decomposition;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A message accepted by the SMTP server.
///
/// Built once at the end of a successful DATA phase and shared as
/// `Arc<Message>` afterwards; nothing mutates it after it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier assigned at capture time
    pub id: String,

    /// Sender: the `From` header, or the envelope sender when the header is absent
    pub from: String,

    /// `To` header addresses, or the envelope recipients when the header is absent
    pub to: Vec<String>,

    pub cc: Vec<String>,

    pub bcc: Vec<String>,

    pub reply_to: Option<String>,

    /// Subject with RFC 2047 encoded words resolved
    pub subject: String,

    /// Plain text payload
    pub body: String,

    /// HTML payload
    pub html: String,

    /// Remaining headers with their raw values, in arrival order per name
    pub headers: BTreeMap<String, Vec<String>>,

    /// When the server accepted the message
    pub timestamp: DateTime<Utc>,

    /// Reverse-path given with `MAIL FROM`
    pub envelope_from: String,

    /// Forward-paths given with `RCPT TO`
    pub envelope_to: Vec<String>,

    /// DATA bytes exactly as received, after dot-unstuffing
    #[serde(with = "raw_base64")]
    pub raw: Vec<u8>,
}

impl Message {
    /// Assemble a message from the envelope, the DATA bytes and their decomposition
    pub fn capture(
        envelope_from: String,
        envelope_to: Vec<String>,
        raw: Vec<u8>,
        parts: Decomposition,
    ) -> Self {
        let from = parts
            .from
            .filter(|from| !from.is_empty())
            .unwrap_or_else(|| envelope_from.clone());
        let to = parts.to.unwrap_or_else(|| envelope_to.clone());

        Self {
            id: Uuid::new_v4().to_string(),
            from,
            to,
            cc: parts.cc,
            bcc: parts.bcc,
            reply_to: parts.reply_to,
            subject: parts.subject,
            body: parts.body,
            html: parts.html,
            headers: parts.headers,
            timestamp: Utc::now(),
            envelope_from,
            envelope_to,
            raw,
        }
    }

    /// Size of the raw message in bytes
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// Raw message as text, with invalid UTF-8 replaced
    pub fn raw_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    /// Check whether an address appears among the header or envelope recipients
    pub fn has_recipient(&self, recipient: &str) -> bool {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .chain(&self.envelope_to)
            .any(|addr| addr == recipient)
    }
}

/// `raw` travels as base64 in snapshots so arbitrary bytes survive JSON
mod raw_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(raw: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(raw))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
