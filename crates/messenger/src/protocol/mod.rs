//! Wire protocol shared by every peer.
//!
//! This module contains:
//! - The seven message kinds and their constructors
//! - Type guards that validate untrusted JSON before any field is read
//! - Broadcast filters addressing peers by name pattern

mod filter;
mod message;

pub use filter::BroadcastFilter;
pub use message::{
    BROADCAST, Broadcast, CallId, ERROR, ErrorMessage, METHOD_ADVERTISEMENT, METHOD_CALL,
    METHOD_COMPLETION, METHOD_RETURN, METHOD_UNSUBSCRIBE, Message, MethodAdvertisement,
    MethodCall, MethodCompletion, MethodReturn, MethodUnsubscribe, is_broadcast, is_error,
    is_message, is_method_advertisement, is_method_call, is_method_completion, is_method_return,
    is_method_unsubscribe,
};
