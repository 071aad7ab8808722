//! Intercepting proxy module
//!
//! Accepts browser connections, terminates TLS with issued certificates,
//! and runs every exchange through the [`InterceptionEngine`] so it can be
//! recorded, rewritten by hooks, or held for the operator.

mod conn;
mod engine;
mod intercept;
mod passthrough;
mod server;
mod tls;
mod upstream;
mod websocket;

pub use conn::{BoxIo, HttpConn, Io, WireBody};
pub use engine::{
    FrameCapture, FrameVerdict, HeldFrame, InterceptionEngine, RequestVerdict, ResponseStart,
    DROPPED_BODY,
};
pub use intercept::{
    InterceptAction, InterceptHandle, InterceptOutcome, InterceptQueue, InterceptedView,
};
pub use passthrough::Passthrough;
pub use server::ProxyServer;
pub use tls::TlsFactory;
pub use upstream::Upstream;
