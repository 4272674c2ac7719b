//! Message kinds and type guards.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::BroadcastFilter;
use crate::error::{Error, Result};

/// Wire tag of [`MethodAdvertisement`].
pub const METHOD_ADVERTISEMENT: &str = "method-advertisement";
/// Wire tag of [`MethodCall`].
pub const METHOD_CALL: &str = "method-call";
/// Wire tag of [`MethodReturn`].
pub const METHOD_RETURN: &str = "method-return";
/// Wire tag of [`MethodCompletion`].
pub const METHOD_COMPLETION: &str = "method-completion";
/// Wire tag of [`MethodUnsubscribe`].
pub const METHOD_UNSUBSCRIBE: &str = "method-unsubscribe";
/// Wire tag of [`ErrorMessage`].
pub const ERROR: &str = "error";
/// Wire tag of [`Broadcast`].
pub const BROADCAST: &str = "broadcast";

/// Correlation id of one call.
///
/// Ids minted locally are random UUIDs; ids from peers are taken as any
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Mint a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The set of method names a peer offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodAdvertisement {
    /// Offered method names.
    pub methods: Vec<String>,
}

impl MethodAdvertisement {
    /// Advertise `methods`.
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }
}

/// Invoke `method` with `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Correlation id chosen by the caller.
    pub id: CallId,
    /// Method name.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

impl MethodCall {
    /// Build a call with a freshly minted id.
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::with_id(CallId::new(), method, args)
    }

    /// Build a call with a caller-chosen id.
    pub fn with_id(id: CallId, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            args,
        }
    }
}

/// One value produced by call `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodReturn {
    /// Call this value belongs to.
    pub id: CallId,
    /// The value; `null` when the field is absent.
    #[serde(default)]
    pub value: Value,
}

impl MethodReturn {
    /// Return `value` for call `id`.
    #[must_use]
    pub fn new(id: CallId, value: Value) -> Self {
        Self { id, value }
    }
}

/// Call `id` produced its last value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCompletion {
    /// Completed call.
    pub id: CallId,
}

impl MethodCompletion {
    /// Complete call `id`.
    #[must_use]
    pub fn new(id: CallId) -> Self {
        Self { id }
    }
}

/// The caller abandons call `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodUnsubscribe {
    /// Abandoned call.
    pub id: CallId,
}

impl MethodUnsubscribe {
    /// Unsubscribe from call `id`.
    #[must_use]
    pub fn new(id: CallId) -> Self {
        Self { id }
    }
}

/// Call `id` failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Failed call.
    pub id: CallId,
    /// Human readable failure.
    pub message: String,
    /// Diagnostic trace, if the answering side has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorMessage {
    /// Fail call `id`.
    pub fn new(id: CallId, message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            id,
            message: message.into(),
            stack,
        }
    }

    /// Fail call `id` with a local error.
    #[must_use]
    pub fn from_error(id: CallId, error: &Error) -> Self {
        Self::new(id, error.to_string(), error.stack())
    }
}

/// Fire-and-forget notification for every peer whose name matches `filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    /// Payload.
    pub data: Value,
    /// Recipient name pattern.
    pub filter: BroadcastFilter,
}

impl Broadcast {
    /// Broadcast `data` to peers matching `filter`.
    #[must_use]
    pub fn new(data: Value, filter: BroadcastFilter) -> Self {
        Self { data, filter }
    }
}

/// Any message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// See [`MethodAdvertisement`].
    MethodAdvertisement(MethodAdvertisement),
    /// See [`MethodCall`].
    MethodCall(MethodCall),
    /// See [`MethodReturn`].
    MethodReturn(MethodReturn),
    /// See [`MethodCompletion`].
    MethodCompletion(MethodCompletion),
    /// See [`MethodUnsubscribe`].
    MethodUnsubscribe(MethodUnsubscribe),
    /// See [`ErrorMessage`].
    Error(ErrorMessage),
    /// See [`Broadcast`].
    Broadcast(Broadcast),
}

impl Message {
    /// Validate and decode an untrusted value.
    ///
    /// Returns `None` for anything that is not a well-formed message.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        let valid = match kind_of(&value)? {
            METHOD_ADVERTISEMENT => is_method_advertisement(&value),
            METHOD_CALL => is_method_call(&value),
            METHOD_RETURN => is_method_return(&value),
            METHOD_COMPLETION => is_method_completion(&value),
            METHOD_UNSUBSCRIBE => is_method_unsubscribe(&value),
            ERROR => is_error(&value),
            BROADCAST => is_broadcast(&value),
            _ => false,
        };

        if !valid {
            return None;
        }

        serde_json::from_value(value).ok()
    }

    /// Encode for the transport.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the message cannot be represented as JSON.
    pub fn into_value(self) -> Result<Value> {
        serde_json::to_value(self).map_err(Error::from)
    }

    /// Wire tag of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MethodAdvertisement(_) => METHOD_ADVERTISEMENT,
            Self::MethodCall(_) => METHOD_CALL,
            Self::MethodReturn(_) => METHOD_RETURN,
            Self::MethodCompletion(_) => METHOD_COMPLETION,
            Self::MethodUnsubscribe(_) => METHOD_UNSUBSCRIBE,
            Self::Error(_) => ERROR,
            Self::Broadcast(_) => BROADCAST,
        }
    }
}

macro_rules! impl_from_kind {
    ($($kind:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$kind> for Message {
                fn from(message: $kind) -> Self {
                    Self::$variant(message)
                }
            }
        )*
    };
}

impl_from_kind! {
    MethodAdvertisement => MethodAdvertisement,
    MethodCall => MethodCall,
    MethodReturn => MethodReturn,
    MethodCompletion => MethodCompletion,
    MethodUnsubscribe => MethodUnsubscribe,
    ErrorMessage => Error,
    Broadcast => Broadcast,
}

fn kind_of(value: &Value) -> Option<&str> {
    value.as_object()?.get("type")?.as_str()
}

fn has_kind(value: &Value, kind: &str) -> bool {
    kind_of(value) == Some(kind)
}

fn has_string(value: &Value, field: &str) -> bool {
    value.get(field).is_some_and(Value::is_string)
}

/// Whether `value` carries a recognized message tag.
#[must_use]
pub fn is_message(value: &Value) -> bool {
    matches!(
        kind_of(value),
        Some(
            METHOD_ADVERTISEMENT
                | METHOD_CALL
                | METHOD_RETURN
                | METHOD_COMPLETION
                | METHOD_UNSUBSCRIBE
                | ERROR
                | BROADCAST
        )
    )
}

/// Whether `value` is a well-formed [`MethodAdvertisement`].
#[must_use]
pub fn is_method_advertisement(value: &Value) -> bool {
    has_kind(value, METHOD_ADVERTISEMENT)
        && value
            .get("methods")
            .and_then(Value::as_array)
            .is_some_and(|methods| methods.iter().all(Value::is_string))
}

/// Whether `value` is a well-formed [`MethodCall`].
#[must_use]
pub fn is_method_call(value: &Value) -> bool {
    has_kind(value, METHOD_CALL)
        && has_string(value, "id")
        && has_string(value, "method")
        && value.get("args").is_some_and(Value::is_array)
}

/// Whether `value` is a well-formed [`MethodReturn`].
#[must_use]
pub fn is_method_return(value: &Value) -> bool {
    has_kind(value, METHOD_RETURN) && has_string(value, "id")
}

/// Whether `value` is a well-formed [`MethodCompletion`].
#[must_use]
pub fn is_method_completion(value: &Value) -> bool {
    has_kind(value, METHOD_COMPLETION) && has_string(value, "id")
}

/// Whether `value` is a well-formed [`MethodUnsubscribe`].
#[must_use]
pub fn is_method_unsubscribe(value: &Value) -> bool {
    has_kind(value, METHOD_UNSUBSCRIBE) && has_string(value, "id")
}

/// Whether `value` is a well-formed [`ErrorMessage`].
#[must_use]
pub fn is_error(value: &Value) -> bool {
    has_kind(value, ERROR)
        && has_string(value, "id")
        && has_string(value, "message")
        && value
            .get("stack")
            .is_none_or(|stack| stack.is_null() || stack.is_string())
}

/// Whether `value` is a well-formed [`Broadcast`].
#[must_use]
pub fn is_broadcast(value: &Value) -> bool {
    has_kind(value, BROADCAST)
        && value.get("data").is_some()
        && value
            .get("filter")
            .is_some_and(|filter| has_string(filter, "source") && has_string(filter, "flags"))
}
