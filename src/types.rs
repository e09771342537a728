//! Core value types: application identity, routing metadata, and the
//! handler/upstream registries.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// Identity of a registered application instance.
///
/// Immutable after `Rpc::register`. The token authenticates every frame
/// this instance sends or accepts.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Application name, shared by all instances of the same app.
    pub name: String,
    /// Unique id of this instance within the app group.
    pub instance: String,
    /// Shared secret carried in every frame.
    pub token: String,
}

/// Originating application of a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Application name.
    pub name: String,
    /// Instance id.
    pub instance: String,
}

impl Sender {
    /// Create a sender describing the given application instance.
    pub fn new(name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: instance.into(),
        }
    }
}

/// Final consumer of a frame and the handler that should process it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Target application name.
    pub name: String,
    /// Target instance id. Empty means group-addressed: any instance of
    /// the app may consume the message.
    pub instance: String,
    /// Name of the handler registered at the destination.
    pub handler: String,
    /// Route through the topic (fan-out) exchange instead of the
    /// app-specific direct exchange.
    pub broadcast: bool,
}

impl Destination {
    /// Address a specific instance of an application.
    pub fn unicast(
        name: impl Into<String>,
        instance: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instance: instance.into(),
            handler: handler.into(),
            broadcast: false,
        }
    }

    /// Address any instance of an application group.
    pub fn group(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: String::new(),
            handler: handler.into(),
            broadcast: false,
        }
    }

    /// Fan out to every live instance of an application group.
    pub fn broadcast(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: String::new(),
            handler: handler.into(),
            broadcast: true,
        }
    }
}

/// Intermediate proxy hop for a frame.
///
/// When `handler` is non-empty the frame is delivered to the hop's
/// registered [`Upstream`] instead of a destination [`Handler`]. The
/// default (all fields empty) means no proxy hop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receiver {
    /// Proxy application name.
    pub name: String,
    /// Proxy instance id, empty for group-addressed.
    pub instance: String,
    /// Name of the upstream registered at the proxy.
    pub handler: String,
    /// Route the hop through its topic exchange.
    pub broadcast: bool,
}

impl Receiver {
    /// Route through any instance of a proxy application group.
    pub fn group(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: String::new(),
            handler: handler.into(),
            broadcast: false,
        }
    }

    /// Route through a specific proxy instance.
    pub fn unicast(
        name: impl Into<String>,
        instance: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instance: instance.into(),
            handler: handler.into(),
            broadcast: false,
        }
    }

    /// True when no proxy hop was requested.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.instance.is_empty() && self.handler.is_empty()
    }
}

/// Connection lifecycle state, observable through `Rpc::state`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    /// Not connected and not dialing.
    #[default]
    Disconnected,
    /// A dial attempt is in flight.
    Connecting,
    /// Waiting out the backoff interval before the next dial.
    Reconnecting,
    /// Topology declared, consumers started.
    Subscribed,
    /// Fully connected and dispatching.
    Connected,
    /// Explicit shutdown in progress.
    ShuttingDown,
}

/// Callback processing frames addressed to a local handler name.
pub trait Handler: Send + Sync {
    /// Process a payload from the given sender.
    fn handle(&self, sender: Sender, payload: Bytes) -> BoxFuture<'static, Result<(), RpcError>>;
}

/// Callback bridging frames toward their true destination.
///
/// Invoked instead of a [`Handler`] when the frame carries a proxy hop
/// naming this upstream.
pub trait Upstream: Send + Sync {
    /// Forward a payload toward the destination it was addressed to.
    fn forward(
        &self,
        sender: Sender,
        destination: Destination,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<(), RpcError>>;
}

/// Name-keyed handler and upstream registrations.
///
/// Written only during the setup phase before `Rpc::listen`, then frozen
/// behind an `Arc` and read concurrently by the dispatch loops.
#[derive(Default)]
pub(crate) struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    upstreams: HashMap<String, Arc<dyn Upstream>>,
}

impl Registry {
    pub(crate) fn set_handler(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub(crate) fn set_upstream(&mut self, name: impl Into<String>, upstream: Arc<dyn Upstream>) {
        self.upstreams.insert(name.into(), upstream);
    }

    pub(crate) fn handler(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(name)
    }

    pub(crate) fn upstream(&self, name: &str) -> Option<&Arc<dyn Upstream>> {
        self.upstreams.get(name)
    }
}
