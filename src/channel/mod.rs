//! Control channel request/response and the notification uplink.
//!
//! Requests arrive as JSON `{ method, id, handlerId, data }` and every
//! dispatch terminates in exactly one [`Response`]: accepted (optionally
//! with data) or rejected with a reason. Notifications flow the other way
//! through a single [`Notifier::emit`] abstraction onto a queue the worker
//! drains.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::str::FromStr;

use serde_json::{json, Value};
use thiserror::Error;

/// Errors raised while handling a control request. Caught at the dispatch
/// boundary and translated into a [`Response::Rejected`]; consumer state
/// is unchanged on rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The caller supplied malformed JSON or missing/ill-typed fields.
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Any other request failure, including unknown methods.
    #[error("{0}")]
    Error(String),
}

impl RequestError {
    pub fn type_error(reason: impl Into<String>) -> RequestError {
        RequestError::TypeError(reason.into())
    }

    pub fn error(reason: impl Into<String>) -> RequestError {
        RequestError::Error(reason.into())
    }

    fn error_name(&self) -> &'static str {
        match self {
            RequestError::TypeError(_) => "TypeError",
            RequestError::Error(_) => "Error",
        }
    }

    fn reason(&self) -> &str {
        match self {
            RequestError::TypeError(r) => r,
            RequestError::Error(r) => r,
        }
    }
}

/// Consumer method ids recognised on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMethod {
    Dump,
    GetStats,
    Pause,
    Resume,
    EnablePacketEvent,
    RequestKeyFrame,
}

impl FromStr for ConsumerMethod {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consumer.dump" => Ok(ConsumerMethod::Dump),
            "consumer.getStats" => Ok(ConsumerMethod::GetStats),
            "consumer.pause" => Ok(ConsumerMethod::Pause),
            "consumer.resume" => Ok(ConsumerMethod::Resume),
            "consumer.enablePacketEvent" => Ok(ConsumerMethod::EnablePacketEvent),
            "consumer.requestKeyFrame" => Ok(ConsumerMethod::RequestKeyFrame),
            _ => Err(RequestError::error(format!("unknown method '{s}'"))),
        }
    }
}

/// A parsed control request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u32,
    pub handler_id: String,
    pub method: ConsumerMethod,
    pub data: Value,
}

impl Request {
    /// Parse a raw channel message. The method string must be known and
    /// `id` present; `data` defaults to an empty object.
    pub fn parse(json: &Value) -> Result<Request, RequestError> {
        let id = json
            .get("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RequestError::error("missing id"))?;

        let method = json
            .get("method")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RequestError::error("missing method"))?;

        let handler_id = json
            .get("handlerId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let data = json.get("data").cloned().unwrap_or_else(|| json!({}));

        Ok(Request {
            id: id as u32,
            handler_id,
            method: method.parse()?,
            data,
        })
    }

    pub fn new(id: u32, handler_id: &str, method: ConsumerMethod, data: Value) -> Request {
        Request {
            id,
            handler_id: handler_id.to_string(),
            method,
            data,
        }
    }
}

/// The single terminal outcome of handling a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Accepted { data: Option<Value> },
    Rejected { error: RequestError },
}

impl Response {
    pub fn accept() -> Response {
        Response::Accepted { data: None }
    }

    pub fn accept_data(data: Value) -> Response {
        Response::Accepted { data: Some(data) }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Response::Accepted { .. })
    }

    /// The wire form sent back over the channel.
    pub fn to_json(&self, request_id: u32) -> Value {
        match self {
            Response::Accepted { data: None } => json!({
                "id": request_id,
                "accepted": true,
            }),
            Response::Accepted { data: Some(data) } => json!({
                "id": request_id,
                "accepted": true,
                "data": data,
            }),
            Response::Rejected { error } => json!({
                "id": request_id,
                "error": error.error_name(),
                "reason": error.reason(),
            }),
        }
    }
}

impl From<RequestError> for Response {
    fn from(error: RequestError) -> Response {
        Response::Rejected { error }
    }
}

impl From<Result<Option<Value>, RequestError>> for Response {
    fn from(result: Result<Option<Value>, RequestError>) -> Response {
        match result {
            Ok(data) => Response::Accepted { data },
            Err(error) => Response::Rejected { error },
        }
    }
}

/// One uplink notification, subject first (typically a consumer id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub event: &'static str,
    pub data: Option<Value>,
}

/// Cloneable handle onto the worker's notification queue.
///
/// The forwarding core runs on one event loop, so the queue is a plain
/// `Rc<RefCell<..>>`; the worker drains it between callbacks.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    queue: Rc<RefCell<VecDeque<Notification>>>,
}

impl Notifier {
    pub fn new() -> Notifier {
        Notifier::default()
    }

    pub fn emit(&self, subject: &str, event: &'static str, data: Option<Value>) {
        self.queue.borrow_mut().push_back(Notification {
            subject: subject.to_string(),
            event,
            data,
        });
    }

    /// Take all queued notifications.
    pub fn drain(&self) -> Vec<Notification> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}
