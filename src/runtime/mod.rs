//! Isolated-execution runtime boundary.
//!
//! [`RuntimeClient`] abstracts the container runtime the agent runs in:
//! create, attach, exec, list, kill and inspect. The session manager only
//! talks to this trait, so tests drive it with an in-memory fake and
//! production uses [`docker::DockerCli`].
//!
//! Submodules:
//! - `docker`: container-CLI implementation driven through `tokio::process`.
//! - `discovery`: shared-instance discovery and network inference policy.

pub mod discovery;
pub mod docker;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

/// Boxed future returned by [`RuntimeClient`] methods.
pub type RuntimeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Everything needed to create a fresh instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Instance name.
    pub name: String,
    /// Image or template to create the instance from.
    pub image: String,
    /// Command the instance runs; its stdio becomes the duplex stream.
    pub command: Vec<String>,
    /// Environment forwarded verbatim into the command.
    pub env: Vec<(String, String)>,
    /// Network to join, if any.
    pub network: Option<String>,
    /// Labels applied to the instance.
    pub labels: BTreeMap<String, String>,
    /// Working directory inside the instance.
    pub workdir: Option<String>,
    /// Remove the instance once it exits.
    pub auto_remove: bool,
}

/// Reference to a runtime instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    /// Runtime-assigned identifier.
    pub id: String,
    /// Instance name, when known.
    pub name: Option<String>,
}

impl InstanceHandle {
    /// Handle with an id only.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", short_id(&self.id)),
            None => f.write_str(short_id(&self.id)),
        }
    }
}

/// Instance summary returned by [`RuntimeClient::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceDescriptor {
    /// Runtime-assigned identifier.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Whether the instance is running.
    pub running: bool,
    /// Instance labels.
    pub labels: BTreeMap<String, String>,
}

impl InstanceDescriptor {
    /// Handle referring to this instance.
    #[must_use]
    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            id: self.id.clone(),
            name: Some(self.name.clone()),
        }
    }

    /// Whether the instance carries `key=value`.
    #[must_use]
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).is_some_and(|v| v == value)
    }
}

/// Instance metadata returned by [`RuntimeClient::inspect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceMetadata {
    /// Runtime-assigned identifier.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Networks the instance is attached to, sorted.
    pub networks: Vec<String>,
    /// Instance labels.
    pub labels: BTreeMap<String, String>,
}

/// Signals the manager sends to instances. Exec'd commands are interrupted
/// through their input instead, so a hard kill is the only one needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSignal {
    /// `SIGKILL`.
    Kill,
}

impl RuntimeSignal {
    /// Signal name as understood by the runtime CLI.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kill => "SIGKILL",
        }
    }
}

/// Bidirectional byte stream attached to the agent process.
pub struct DuplexStream {
    /// Agent output.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    /// Agent input.
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    /// Transport resources kept alive for the stream's lifetime; dropping
    /// them tears the stream down.
    pub keepalive: Option<Box<dyn Any + Send>>,
}

impl DuplexStream {
    /// Stream over an output reader and input writer with nothing to keep alive.
    pub fn new<R, W>(output: R, input: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            output: Box::new(output),
            input: Box::new(input),
            keepalive: None,
        }
    }
}

impl fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexStream")
            .field("keepalive", &self.keepalive.is_some())
            .finish_non_exhaustive()
    }
}

/// Abstraction over the isolated-execution runtime.
pub trait RuntimeClient: Send + Sync {
    /// Create (but do not start) a fresh instance.
    ///
    /// # Errors
    ///
    /// [`AppError::RuntimeUnavailable`](crate::AppError::RuntimeUnavailable)
    /// when the runtime or the image is missing,
    /// [`AppError::Runtime`](crate::AppError::Runtime) for other failures.
    fn create(&self, spec: &InstanceSpec) -> RuntimeFuture<'_, InstanceHandle>;

    /// Start the instance and attach to its main process.
    ///
    /// # Errors
    ///
    /// [`AppError::Runtime`](crate::AppError::Runtime) when attaching fails.
    fn attach(&self, handle: &InstanceHandle) -> RuntimeFuture<'_, DuplexStream>;

    /// Run `cmd` inside a running instance and attach to it.
    ///
    /// # Errors
    ///
    /// [`AppError::Runtime`](crate::AppError::Runtime) when the exec fails.
    fn exec(
        &self,
        handle: &InstanceHandle,
        cmd: &[String],
        env: &[(String, String)],
    ) -> RuntimeFuture<'_, DuplexStream>;

    /// List running instances.
    ///
    /// # Errors
    ///
    /// [`AppError::RuntimeUnavailable`](crate::AppError::RuntimeUnavailable)
    /// when the runtime cannot be reached.
    fn list(&self) -> RuntimeFuture<'_, Vec<InstanceDescriptor>>;

    /// Send `signal` to an instance.
    ///
    /// # Errors
    ///
    /// [`AppError::Runtime`](crate::AppError::Runtime) when the signal could
    /// not be delivered.
    fn kill(&self, handle: &InstanceHandle, signal: RuntimeSignal) -> RuntimeFuture<'_, ()>;

    /// Fetch instance metadata (networks, labels).
    ///
    /// # Errors
    ///
    /// [`AppError::Runtime`](crate::AppError::Runtime) when inspection fails.
    fn inspect(&self, handle: &InstanceHandle) -> RuntimeFuture<'_, InstanceMetadata>;
}

/// Split a `key=value` label selector.
#[must_use]
pub fn parse_label(selector: &str) -> Option<(&str, &str)> {
    selector
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
