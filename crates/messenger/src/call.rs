//! Result streams of method calls.

use std::fmt::{self, Debug};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// Values produced by one call, local or remote.
///
/// The stream yields zero or more `Ok` values and ends on completion. A
/// failure is yielded as a single `Err` item after which the stream ends.
/// Dropping the stream early abandons the call; for remote calls this
/// unsubscribes from the peer.
pub struct CallStream {
    // None once the call has ended
    inner: Option<BoxStream<'static, Result<Value>>>,
}

impl CallStream {
    /// Wrap a stream of results, ending it after the first failure.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self {
            inner: Some(stream.boxed()),
        }
    }

    /// A call producing exactly one value.
    #[must_use]
    pub fn once(value: Value) -> Self {
        Self {
            inner: Some(stream::iter([Ok(value)]).boxed()),
        }
    }

    /// A call that failed before producing anything.
    #[must_use]
    pub fn failed(error: Error) -> Self {
        Self {
            inner: Some(stream::iter([Err(error)]).boxed()),
        }
    }

    /// Take the first value as `T` and abandon the rest.
    ///
    /// # Errors
    ///
    /// Returns the call's failure, `NoValue` if the call completed without a
    /// value, or a codec error if the value is not a `T`.
    pub async fn value<T: DeserializeOwned>(mut self) -> Result<T> {
        match self.next().await {
            Some(Ok(value)) => Ok(serde_json::from_value(value)?),
            Some(Err(error)) => Err(error),
            None => Err(Error::NoValue),
        }
    }

    /// Collect every value as `T` until the call completes.
    ///
    /// # Errors
    ///
    /// Returns the call's failure or a codec error if a value is not a `T`.
    pub async fn values<T: DeserializeOwned>(mut self) -> Result<Vec<T>> {
        let mut values = Vec::new();

        while let Some(item) = self.next().await {
            values.push(serde_json::from_value(item?)?);
        }

        Ok(values)
    }
}

impl Stream for CallStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };

        let item = ready!(inner.poll_next_unpin(cx));

        // Release the producer as soon as the call has ended
        if !matches!(item, Some(Ok(_))) {
            self.inner = None;
        }

        Poll::Ready(item)
    }
}

impl Debug for CallStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStream").finish_non_exhaustive()
    }
}

/// Anything that can invoke methods by name.
pub trait MethodCaller {
    /// Invoke `method` with positional `args`.
    ///
    /// Never fails synchronously: every failure arrives on the stream.
    fn call_method(&self, method: &str, args: Vec<Value>) -> CallStream;
}
