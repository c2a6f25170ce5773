use serde::{Deserialize, Serialize};

use crate::error::PayloadError;

/// A request to send one HTML email, as published on the queue.
///
/// Wire keys are `To`, `Subject` and `Body`; lower-case keys are accepted as
/// well and any other keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRequest {
    #[serde(rename = "To", alias = "to")]
    to: String,

    #[serde(rename = "Subject", alias = "subject")]
    subject: String,

    #[serde(rename = "Body", alias = "body")]
    body: String,
}

impl EmailRequest {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Decode a delivery body.
    ///
    /// # Errors
    /// If the payload isn't UTF-8, isn't a JSON object, or lacks one of the
    /// three fields.
    pub fn from_payload(payload: &[u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(payload)?;
        Ok(serde_json::from_str(text)?)
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// HTML body.
    pub fn body(&self) -> &str {
        &self.body
    }
}
