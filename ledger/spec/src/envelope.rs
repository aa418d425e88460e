//! Post data conventions used for service calls, replies, watermarks and
//! named variables. None of these are enforced by the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{PostId, PulseId, ValidationError};

/// Prefix of a service call post.
pub const CALL_PREFIX: &str = "c:";
/// Prefix of a service reply post.
pub const RETURN_PREFIX: &str = "r:";
/// Prefix of a service watermark post.
pub const LAST_READ_PREFIX: &str = "l:";
/// Prefix of a JSON variable post.
pub const VAR_JSON_PREFIX: &str = "v:json:";

const ERROR_TAG: &str = "e:";

/// Errors raised while parsing post data conventions.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Data does not start with the expected prefix.
    #[error("missing {0:?} prefix")]
    MissingPrefix(String),
    /// Payload is not JSON.
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    /// JSON of the wrong shape.
    #[error("unexpected envelope shape: {0}")]
    Shape(String),
}

/// `c:[serviceName, args]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallEnvelope {
    /// Name of the service to invoke.
    pub service: String,
    /// Arguments, a JSON list or mapping.
    pub args: Value,
}

impl CallEnvelope {
    /// Build a call, rejecting args that are neither list nor mapping.
    pub fn new(service: impl Into<String>, args: Value) -> Result<Self, ValidationError> {
        if !(args.is_array() || args.is_object()) {
            return Err(ValidationError::InvalidArgs);
        }
        Ok(Self {
            service: service.into(),
            args,
        })
    }

    /// Post data for this call.
    pub fn encode(&self) -> String {
        let body = Value::Array(vec![Value::String(self.service.clone()), self.args.clone()]);
        format!("{CALL_PREFIX}{body}")
    }

    /// Parse post data produced by [`CallEnvelope::encode`].
    pub fn parse(data: &str) -> Result<Self, EnvelopeError> {
        let body = data
            .strip_prefix(CALL_PREFIX)
            .ok_or_else(|| EnvelopeError::MissingPrefix(CALL_PREFIX.into()))?;
        let value: Value = serde_json::from_str(body)?;
        match value {
            Value::Array(mut parts) if parts.len() == 2 => {
                let args = parts.pop().unwrap_or(Value::Null);
                let service = match parts.pop() {
                    Some(Value::String(name)) => name,
                    _ => return Err(EnvelopeError::Shape("service name must be a string".into())),
                };
                Ok(Self { service, args })
            }
            _ => Err(EnvelopeError::Shape("call must be [name, args]".into())),
        }
    }
}

/// `r:<postId>:<json>` or `r:<postId>:e:<message>`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnEnvelope {
    /// Handler produced a value.
    Success {
        /// Post id of the call being answered.
        request: PostId,
        /// Returned value.
        result: Value,
    },
    /// Handler failed.
    Failure {
        /// Post id of the call being answered.
        request: PostId,
        /// Error message, may contain colons.
        message: String,
    },
}

impl ReturnEnvelope {
    /// Prefix shared by every reply to `request`.
    pub fn prefix_for(request: PostId) -> String {
        format!("{RETURN_PREFIX}{request}:")
    }

    /// Post id of the answered call.
    pub fn request(&self) -> PostId {
        match self {
            ReturnEnvelope::Success { request, .. } | ReturnEnvelope::Failure { request, .. } => {
                *request
            }
        }
    }

    /// Post data for this reply.
    pub fn encode(&self) -> String {
        match self {
            ReturnEnvelope::Success { request, result } => {
                format!("{}{result}", Self::prefix_for(*request))
            }
            ReturnEnvelope::Failure { request, message } => {
                format!("{}{ERROR_TAG}{message}", Self::prefix_for(*request))
            }
        }
    }

    /// Parse a reply to `request`.
    pub fn parse(request: PostId, data: &str) -> Result<Self, EnvelopeError> {
        let prefix = Self::prefix_for(request);
        let body = data
            .strip_prefix(prefix.as_str())
            .ok_or(EnvelopeError::MissingPrefix(prefix))?;
        if let Some(message) = body.strip_prefix(ERROR_TAG) {
            return Ok(ReturnEnvelope::Failure {
                request,
                message: message.to_string(),
            });
        }
        Ok(ReturnEnvelope::Success {
            request,
            result: serde_json::from_str(body)?,
        })
    }
}

/// `l:<pulseId>`: highest pulse id a service has served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LastReadMarker(pub PulseId);

impl LastReadMarker {
    /// Post data for this marker.
    pub fn encode(&self) -> String {
        format!("{LAST_READ_PREFIX}{}", self.0)
    }

    /// Parse post data produced by [`LastReadMarker::encode`].
    pub fn parse(data: &str) -> Result<Self, EnvelopeError> {
        let body = data
            .strip_prefix(LAST_READ_PREFIX)
            .ok_or_else(|| EnvelopeError::MissingPrefix(LAST_READ_PREFIX.into()))?;
        body.trim()
            .parse()
            .map(LastReadMarker)
            .map_err(|_| EnvelopeError::Shape(format!("marker {body:?} is not a pulse id")))
    }
}

/// Check a variable name for use inside a `v:json:` prefix.
pub fn validate_var_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.contains([':', '%', '\'', '"']) {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Prefix of the variable `name`.
pub fn var_prefix(name: &str) -> String {
    format!("{VAR_JSON_PREFIX}{name}:")
}

/// Post data publishing `value` under `name`.
pub fn encode_var(name: &str, value: &Value) -> Result<String, ValidationError> {
    validate_var_name(name)?;
    Ok(format!("{}{value}", var_prefix(name)))
}
