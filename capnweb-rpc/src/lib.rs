//! A capability-based bidirectional RPC runtime speaking the Cap'n Web
//! wire protocol, with promise pipelining.
//!
//! Either peer of a session can export capabilities and invoke the
//! other's. Application code holds stubs and promises; their operations are
//! backed by a hook hierarchy that resolves locally when it can and becomes
//! pipelined wire messages when the capability is remote, so that a chain
//! of dependent calls costs one round trip.
//!
//! The session machinery is single-threaded cooperative: run it under a
//! `tokio` current-thread runtime inside a `LocalSet` and use
//! `tokio::task::spawn_local`, in the style of
//!
//! ```ignore
//! tokio::task::LocalSet::new()
//!     .run_until(async move {
//!         let server = Server::new(ServerConfig::default());
//!         server.register_capability(0, Rc::new(Calculator));
//!         let client = Client::new(
//!             ClientConfig::new("http://localhost:8080/rpc/batch"),
//!             Box::new(server.local_transport()),
//!         );
//!         let sum = client.call(0, "add", vec![5.into(), 3.into()]).await?;
//!         # Ok::<(), capnweb::RpcError>(())
//!     })
//!     .await
//! ```

pub mod batch;
pub mod broken;
pub mod capability;
pub mod client;
pub mod evaluator;
pub mod hooks;
pub mod local;
pub mod map;
pub mod parser;
pub mod payload;
pub mod promise;
pub mod queued;
pub mod resume;
pub mod serializer;
pub mod server;
pub mod session;
pub mod transport;
pub mod value;

pub use crate::batch::{BatchArg, PipelineBatch, PipelinePromise};
pub use crate::capability::{RpcPromise, RpcStub, RpcTarget};
pub use crate::client::{Client, ClientConfig};
pub use crate::map::MapOutcome;
pub use crate::payload::{PayloadSource, RpcPayload};
pub use crate::promise::Promise;
pub use crate::resume::{ResumeToken, ResumeTokenManager};
pub use crate::server::{Server, ServerConfig};
pub use crate::session::RpcSession;
pub use crate::transport::{channel_pair, ChannelTransport, Transport, TransportKind};
pub use crate::value::Value;

pub use capnweb::{ErrorKind, RpcError};
