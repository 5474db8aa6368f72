//! Envelope types for the peepsy wire protocol.
//!
//! Envelopes are self-describing JSON records distinguished by `type`.
//! Encoding always produces the unified flat REQUEST shape; decoding also
//! accepts the legacy nested shape `{type, request: {id, action, data},
//! timeout}` so workers interoperate with older masters. A RESPONSE that
//! carries `errorPayload` but no `error` string is normalized on decode by
//! copying `errorPayload.message` into `error`.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Success status on a RESPONSE.
pub const STATUS_OK: u16 = 200;

/// No handler registered for the requested action.
pub const STATUS_NOT_FOUND: u16 = 404;

/// The handler ran and returned an error.
pub const STATUS_HANDLER_ERROR: u16 = 500;

/// Execution mode a worker is initialized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// One handler at a time, ordered by priority then arrival.
    Sequential,
    /// Handlers run as requests arrive, optionally bounded.
    Concurrent,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMode::Sequential => "sequential",
            WorkerMode::Concurrent => "concurrent",
        }
    }
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error details carried on an error RESPONSE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// INIT - first envelope on a fresh channel, establishes the worker mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Init {
    pub mode: WorkerMode,
}

/// REQUEST - asks the peer to run an action handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: Uuid,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Request {
    /// Build a request with a fresh correlation id.
    pub fn new(action: impl Into<String>, data: Option<Value>, timeout_ms: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            data,
            timeout_ms,
        }
    }

    /// Payload for handler dispatch; missing data maps to JSON null.
    pub fn data_or_null(&self) -> Value {
        self.data.clone().unwrap_or(Value::Null)
    }
}

/// RESPONSE - resolves a REQUEST, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: Uuid,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_payload: Option<ErrorPayload>,
}

impl Response {
    /// A 200 response carrying the handler result.
    pub fn ok(id: Uuid, data: Value) -> Self {
        Self {
            id,
            status: STATUS_OK,
            data: Some(data),
            error: None,
            error_payload: None,
        }
    }

    /// A 404 response for an action with no registered handler.
    pub fn not_found(id: Uuid, action: &str) -> Self {
        let message = format!("No handler registered for action: {}", action);
        Self {
            id,
            status: STATUS_NOT_FOUND,
            data: None,
            error: Some(message.clone()),
            error_payload: Some(ErrorPayload {
                name: "PeepsyNotFoundError".to_string(),
                message,
                code: Some("PEEPSY_NOT_FOUND".to_string()),
                stack: None,
            }),
        }
    }

    /// A 500 response for a handler that returned an error.
    pub fn handler_error(id: Uuid, message: impl Into<String>, stack: Option<String>) -> Self {
        let message = message.into();
        Self {
            id,
            status: STATUS_HANDLER_ERROR,
            data: None,
            error: Some(message.clone()),
            error_payload: Some(ErrorPayload {
                name: "Error".to_string(),
                message,
                code: None,
                stack,
            }),
        }
    }

    /// Any status >= 400 is an error from the sender's viewpoint.
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    /// Human-readable failure summary: `error`, falling back to
    /// `errorPayload.message`.
    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.error_payload.as_ref().map(|p| p.message.as_str()))
    }
}

/// HEARTBEAT - periodic child liveness report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub pid: u32,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_active: Option<u64>,
}

/// A tagged wire envelope. Serialization is always the flat form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "INIT")]
    Init(Init),
    #[serde(rename = "REQUEST")]
    Request(Request),
    #[serde(rename = "RESPONSE")]
    Response(Response),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(Heartbeat),
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
}

impl Envelope {
    pub fn request(req: Request) -> Self {
        Envelope::Request(req)
    }

    pub fn response(resp: Response) -> Self {
        Envelope::Response(resp)
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Init(_) => "INIT",
            Envelope::Request(_) => "REQUEST",
            Envelope::Response(_) => "RESPONSE",
            Envelope::Heartbeat(_) => "HEARTBEAT",
            Envelope::Shutdown => "SHUTDOWN",
        }
    }
}

/// Nested REQUEST body accepted for compatibility.
#[derive(Debug, Deserialize)]
struct NestedRequest {
    id: Uuid,
    action: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Raw decode shape. REQUEST fields are all optional here so both the flat
/// and nested forms parse; normalization picks the canonical fields.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawEnvelope {
    #[serde(rename = "INIT")]
    Init { mode: WorkerMode },
    #[serde(rename = "REQUEST", rename_all = "camelCase")]
    Request {
        #[serde(default)]
        id: Option<Uuid>,
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default)]
        request: Option<NestedRequest>,
    },
    #[serde(rename = "RESPONSE", rename_all = "camelCase")]
    Response {
        id: Uuid,
        status: u16,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        error_payload: Option<ErrorPayload>,
    },
    #[serde(rename = "HEARTBEAT", rename_all = "camelCase")]
    Heartbeat {
        pid: u32,
        timestamp: u64,
        #[serde(default)]
        requests_active: Option<u64>,
    },
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawEnvelope::deserialize(deserializer)?;
        match raw {
            RawEnvelope::Init { mode } => Ok(Envelope::Init(Init { mode })),
            RawEnvelope::Request {
                id,
                action,
                data,
                timeout,
                request,
            } => {
                let req = match request {
                    Some(nested) => Request {
                        id: nested.id,
                        action: nested.action,
                        data: nested.data,
                        timeout_ms: timeout,
                    },
                    None => Request {
                        id: id.ok_or_else(|| D::Error::custom("REQUEST missing id"))?,
                        action: action.ok_or_else(|| D::Error::custom("REQUEST missing action"))?,
                        data,
                        timeout_ms: timeout,
                    },
                };
                Ok(Envelope::Request(req))
            }
            RawEnvelope::Response {
                id,
                status,
                data,
                mut error,
                error_payload,
            } => {
                if error.is_none() {
                    if let Some(ref payload) = error_payload {
                        error = Some(payload.message.clone());
                    }
                }
                Ok(Envelope::Response(Response {
                    id,
                    status,
                    data,
                    error,
                    error_payload,
                }))
            }
            RawEnvelope::Heartbeat {
                pid,
                timestamp,
                requests_active,
            } => Ok(Envelope::Heartbeat(Heartbeat {
                pid,
                timestamp,
                requests_active,
            })),
            RawEnvelope::Shutdown => Ok(Envelope::Shutdown),
        }
    }
}
