use alloc::borrow::Cow;
use alloc::format;
use alloc::string::{String, ToString};

use serde::Serialize;
use serde_json::{Map, Value};

/// The reply field holding the outcome of a command.
pub const STATUS_FIELD: &str = "status";

/// The reply field describing why a command failed.
pub const ERROR_FIELD: &str = "error";

/// The status value of a command completed successfully.
pub const STATUS_OK: &str = "ok";

/// The status value of a failed command.
pub const STATUS_ERROR: &str = "error";

/// A reply notifying the backend that a command completed successfully.
#[derive(Debug, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct OkReply {
    status: Cow<'static, str>,
}

impl OkReply {
    /// Generates an [`OkReply`].
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            status: Cow::Borrowed(STATUS_OK),
        }
    }
}

/// A reply notifying the backend that a command failed.
#[derive(Debug, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct ErrorReply<'a> {
    status: Cow<'a, str>,
    /// Error description.
    pub error: Cow<'a, str>,
}

impl<'a> ErrorReply<'a> {
    /// Generates an [`ErrorReply`] with the given error description.
    #[must_use]
    pub const fn new(error: &'a str) -> Self {
        Self {
            status: Cow::Borrowed(STATUS_ERROR),
            error: Cow::Borrowed(error),
        }
    }
}

/// The outcome carried by a reply.
#[derive(Debug, PartialEq)]
pub enum ReplyOutcome<'a> {
    /// The `status` field equals `"ok"`.
    Success,
    /// Any other reply, along with the reason of the failure.
    Failure(Cow<'a, str>),
}

impl<'a> ReplyOutcome<'a> {
    /// Evaluates a reply object.
    ///
    /// A reply is successful if and only if its `status` field is the
    /// `"ok"` string. Otherwise, the failure reason is taken from the `error`
    /// field, when present.
    #[must_use]
    pub fn evaluate(reply: &'a Map<String, Value>) -> Self {
        let status = reply.get(STATUS_FIELD);
        if status.and_then(Value::as_str) == Some(STATUS_OK) {
            return Self::Success;
        }

        let reason = match (reply.get(ERROR_FIELD), status) {
            (Some(Value::String(error)), _) => Cow::Borrowed(error.as_str()),
            (Some(error), _) => Cow::Owned(error.to_string()),
            (None, Some(status)) => {
                Cow::Owned(format!("Reply with status {status} and no error description"))
            }
            (None, None) => Cow::Borrowed("Reply without a status field"),
        };

        Self::Failure(reason)
    }

    /// Whether the reply is successful.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
