//! AMQP-backed application RPC/pub-sub layer.
//!
//! Each participating process registers an identity (name, instance id,
//! shared token) and can then call or cast messages to named
//! destinations, optionally routed through an intermediate proxy hop,
//! with either guaranteed (durable shared queue) or best-effort
//! (per-instance auto-deleted queue) delivery. Inbound frames are matched
//! against the handlers and upstreams registered before listening and
//! dispatched concurrently.
//!
//! ```ignore
//! let mut rpc = Rpc::register("svc", "i1", "token")?;
//! rpc.set_handler("echo", Arc::new(EchoHandler))?;
//! rpc.listen()?;
//!
//! rpc.call(Destination::unicast("svc", "i1", "echo"), &payload).await?;
//! ```

pub mod codec;
pub mod config;
mod dispatch;
pub mod error;
mod lifecycle;
mod publish;
mod rpc;
mod topology;
mod types;

pub use codec::{Codec, Frame, ProtocolError, MAX_FIELD_LEN, MAX_TOKEN_LEN};
pub use config::{ConfigError, RpcConfig};
pub use error::{Result, RpcError};
pub use rpc::Rpc;
pub use types::{Destination, Handler, Identity, Receiver, Sender, State, Upstream};
