//! Local method registry.
//!
//! Procedures are registered in one of three shapes (a plain value, a future
//! or a stream) and adapted once, at registration, into a uniform
//! [`Procedure`] producing a [`CallStream`]. Callers never see which shape a
//! method was registered with.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use anyhow::Context;
use futures::FutureExt;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::call::{CallStream, MethodCaller};
use crate::error::{Error, Result};

/// A registered method, adapted to the uniform call shape.
pub type Procedure = Arc<dyn Fn(Args) -> CallStream + Send + Sync>;

/// Positional arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    /// Number of arguments supplied.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no arguments were supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw argument at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Argument at `index` as `T`. A missing argument reads as `null`.
    ///
    /// # Errors
    ///
    /// Fails if the argument does not deserialize into `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self.0.get(index).cloned().unwrap_or(Value::Null);

        serde_json::from_value(value).with_context(|| format!("invalid argument {index}"))
    }
}

impl From<Vec<Value>> for Args {
    fn from(args: Vec<Value>) -> Self {
        Self(args)
    }
}

/// Named local procedures.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Procedure>,
}

impl MethodRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method that returns its value immediately.
    #[must_use]
    pub fn value<F, R, E>(self, name: impl Into<String>, procedure: F) -> Self
    where
        F: Fn(Args) -> std::result::Result<R, E> + Send + Sync + 'static,
        R: Serialize + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.register(name, move |args| match procedure(args) {
            Ok(value) => match serde_json::to_value(value) {
                Ok(value) => CallStream::once(value),
                Err(e) => CallStream::failed(e.into()),
            },
            Err(e) => CallStream::failed(Error::Handler(e.into())),
        })
    }

    /// Register a method that resolves to one value.
    #[must_use]
    pub fn future<F, Fut, R, E>(self, name: impl Into<String>, procedure: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.register(name, move |args| {
            let resolved = AssertUnwindSafe(procedure(args))
                .catch_unwind()
                .map(|outcome| match outcome {
                    Ok(result) => encode(result),
                    Err(panic) => Err(Error::Panicked(panic_message(&*panic))),
                });

            CallStream::new(stream::once(resolved))
        })
    }

    /// Register a method that produces a stream of values.
    #[must_use]
    pub fn stream<F, S, R, E>(self, name: impl Into<String>, procedure: F) -> Self
    where
        F: Fn(Args) -> S + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.register(name, move |args| {
            let values = AssertUnwindSafe(procedure(args).boxed())
                .catch_unwind()
                .map(|outcome| match outcome {
                    Ok(result) => encode(result),
                    Err(panic) => Err(Error::Panicked(panic_message(&*panic))),
                });

            CallStream::new(values)
        })
    }

    fn register<F>(mut self, name: impl Into<String>, procedure: F) -> Self
    where
        F: Fn(Args) -> CallStream + Send + Sync + 'static,
    {
        let name = name.into();

        if self
            .methods
            .insert(name.clone(), Arc::new(procedure))
            .is_some()
        {
            warn!("Method '{}' registered twice, keeping the latest", name);
        }

        self
    }

    /// Whether `method` is registered.
    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Invoke a local method.
    ///
    /// Unknown methods, handler errors and panics all surface as a failed
    /// stream.
    pub fn invoke(&self, method: &str, args: Args) -> CallStream {
        let Some(procedure) = self.methods.get(method) else {
            debug!("No local method '{}'", method);
            return CallStream::failed(Error::MethodNotFound(method.to_string()));
        };

        match catch_unwind(AssertUnwindSafe(|| procedure(args))) {
            Ok(results) => results,
            Err(panic) => {
                let message = panic_message(&*panic);
                error!("Method '{}' panicked: {}", method, message);
                CallStream::failed(Error::Panicked(message))
            }
        }
    }
}

impl MethodCaller for MethodRegistry {
    fn call_method(&self, method: &str, args: Vec<Value>) -> CallStream {
        self.invoke(method, Args::from(args))
    }
}

impl Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

fn encode<R, E>(result: std::result::Result<R, E>) -> Result<Value>
where
    R: Serialize,
    E: Into<anyhow::Error>,
{
    let value = result.map_err(|e| Error::Handler(e.into()))?;

    Ok(serde_json::to_value(value)?)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
