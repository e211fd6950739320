//! Bidirectional object RPC over JSON frames.
//!
//! Each side of an [`RpcChannel`] registers [`Stub`]s (local objects exposing
//! a fixed method allowlist) and calls into the peer's stubs through
//! [`Proxy`]s. Objects can travel as arguments and results: a stub exported
//! with [`RpcChannel::export`] reaches the peer as a proxy, and a proxy sent
//! back with [`Proxy::to_value`] resolves to the original stub.
//!
//! Lifetimes are explicit. A proxy tells the owner it is done with
//! [`Proxy::release`]; once every export of a stub has been released (or the
//! channel closes) the stub is dropped and [`Stub::on_released`] runs.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::future::BoxFuture;
//! use serde_json::{json, Value};
//! use thingcloud_common::rpc::{RpcChannel, Stub};
//! use thingcloud_common::Result;
//!
//! struct Echo;
//!
//! impl Stub for Echo {
//!     fn methods(&self) -> &'static [&'static str] {
//!         &["echo"]
//!     }
//!
//!     fn invoke(self: Arc<Self>, _method: String, args: Vec<Value>, _channel: RpcChannel)
//!         -> BoxFuture<'static, Result<Value>>
//!     {
//!         Box::pin(async move { Ok(Value::Array(args)) })
//!     }
//! }
//!
//! # async fn demo() -> Result<()> {
//! let (a, b) = tokio::io::duplex(4096);
//! let server = RpcChannel::over_stream(a);
//! let client = RpcChannel::over_stream(b);
//!
//! let id = server.add_stub(Arc::new(Echo));
//! let echo = client.get_proxy(id);
//! assert_eq!(echo.call("echo", vec![json!(1)]).await?, json!([1]));
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod message;
pub mod proxy;
pub mod stub;

pub use channel::{RpcChannel, RpcObject};
pub use message::{RpcError, RpcMessage, PROXY_MARKER, STUB_MARKER};
pub use proxy::Proxy;
pub use stub::{arg, Stub};
