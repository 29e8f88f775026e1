//! Request and response envelopes.
//!
//! On the wire both are JSON objects whose first field is the body's
//! `action` discriminator. Decoding reads the envelope with the body left
//! as raw JSON, resolves the action, and only then decodes the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::body::{Action, Body};
use super::CodecError;

/// How the server should treat a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    /// Expects one or more responses on the caller's reply topic.
    #[default]
    Call,
    /// Fire-and-forget; the server never responds.
    Push,
    /// Liveness probe answered by the server itself.
    Ping,
}

/// A request travelling from an [`RpcClient`](crate::rpc::RpcClient) to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub body: Option<Body>,
    pub correlation_id: String,
    pub reply_to: Option<String>,
    pub partition_key: Option<String>,
    pub request_type: RequestType,
}

impl Request {
    /// A call carrying `body`, with a fresh correlation id.
    pub fn new(body: Body) -> Self {
        Self {
            body: Some(body),
            correlation_id: Uuid::new_v4().to_string(),
            reply_to: None,
            partition_key: None,
            request_type: RequestType::Call,
        }
    }

    /// A request with no body. Clients reject these for call and push.
    pub fn empty() -> Self {
        Self {
            body: None,
            correlation_id: Uuid::new_v4().to_string(),
            reply_to: None,
            partition_key: None,
            request_type: RequestType::Call,
        }
    }

    pub fn ping() -> Self {
        Self {
            request_type: RequestType::Ping,
            ..Self::empty()
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn action(&self) -> Option<Action> {
        self.body.as_ref().map(Body::action)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let envelope = RequestEnvelope {
            action: self.action().map(|a| a.as_str().to_string()),
            correlation_id: self.correlation_id.clone(),
            reply_to: self.reply_to.clone(),
            partition_key: self.partition_key.clone(),
            request_type: self.request_type,
            body: match &self.body {
                Some(body) => body.encode()?,
                None => Value::Null,
            },
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decodes a request record.
    ///
    /// When the envelope itself parses but its body does not, the error still
    /// carries the correlation id and reply topic so the server can answer.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let envelope: RequestEnvelope =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::malformed(e.into()))?;

        let body = match envelope.resolve_body() {
            Ok(body) => body,
            Err(source) => {
                return Err(DecodeError {
                    correlation_id: Some(envelope.correlation_id),
                    reply_to: envelope.reply_to,
                    partition_key: envelope.partition_key,
                    request_type: envelope.request_type,
                    source,
                })
            }
        };

        Ok(Self {
            body,
            correlation_id: envelope.correlation_id,
            reply_to: envelope.reply_to,
            partition_key: envelope.partition_key,
            request_type: envelope.request_type,
        })
    }
}

/// A request record the server could not turn into a [`Request`].
#[derive(Debug, thiserror::Error)]
#[error("undecodable request {correlation_id:?}: {source}")]
pub struct DecodeError {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub partition_key: Option<String>,
    pub request_type: RequestType,
    #[source]
    pub source: CodecError,
}

impl DecodeError {
    fn malformed(source: CodecError) -> Self {
        Self {
            correlation_id: None,
            reply_to: None,
            partition_key: None,
            request_type: RequestType::Call,
            source,
        }
    }

    /// True when the action tag names nothing in the catalogue.
    pub fn is_unknown_action(&self) -> bool {
        matches!(self.source, CodecError::UnknownAction(_))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_key: Option<String>,
    #[serde(rename = "type", default)]
    request_type: RequestType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    body: Value,
}

impl RequestEnvelope {
    fn resolve_body(&self) -> Result<Option<Body>, CodecError> {
        match (&self.action, &self.body) {
            (None, Value::Null) => Ok(None),
            (None, _) => Err(CodecError::MissingAction),
            (Some(tag), body) => {
                let action: Action = tag.parse()?;
                Body::decode(action, body.clone()).map(Some)
            }
        }
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// A response travelling back to the caller's reply topic.
///
/// `last == false` marks a partial response in a stream; the matcher keeps
/// the pending call registered until a response with `last == true` arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub correlation_id: String,
    pub status: ResponseStatus,
    pub error_code: Option<u16>,
    pub error_message: Option<String>,
    pub last: bool,
    pub body: Option<Body>,
}

impl Response {
    pub fn success(correlation_id: impl Into<String>, body: Body) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Success,
            error_code: None,
            error_message: None,
            last: true,
            body: Some(body),
        }
    }

    /// A successful response with no body (ping answers).
    pub fn empty(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Success,
            error_code: None,
            error_message: None,
            last: true,
            body: None,
        }
    }

    /// A non-final response in a stream.
    pub fn partial(correlation_id: impl Into<String>, body: Body) -> Self {
        Self {
            last: false,
            ..Self::success(correlation_id, body)
        }
    }

    pub fn error(correlation_id: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Error,
            error_code: Some(code),
            error_message: Some(message.into()),
            last: true,
            body: None,
        }
    }

    pub fn with_last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == ResponseStatus::Error
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let envelope = ResponseEnvelope {
            action: self.body.as_ref().map(|b| b.action().as_str().to_string()),
            correlation_id: self.correlation_id.clone(),
            status: self.status,
            error_code: self.error_code,
            error_message: self.error_message.clone(),
            last: self.last,
            body: match &self.body {
                Some(body) => body.encode()?,
                None => Value::Null,
            },
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: ResponseEnvelope = serde_json::from_slice(bytes)?;
        let body = match (envelope.action, envelope.body) {
            (None, Value::Null) => None,
            (None, _) => return Err(CodecError::MissingAction),
            (Some(tag), body) => Some(Body::decode(tag.parse()?, body)?),
        };
        Ok(Self {
            correlation_id: envelope.correlation_id,
            status: envelope.status,
            error_code: envelope.error_code,
            error_message: envelope.error_message,
            last: envelope.last,
            body,
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    correlation_id: String,
    status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(default = "default_last")]
    last: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    body: Value,
}

fn default_last() -> bool {
    true
}
