//! hyview RPC: the wire between a requester and a 3D host.
//!
//! Both processes run a [`transport::Server`] and hold a connection to the
//! other one. The requester's [`app::Orchestrator`] asks the host to create a
//! node, the host's [`host::HostController`] pulls the geometry back over the
//! requester's server and calls `complete`, which unblocks the requester.
//!
//! ```text
//! Requester                                  Host
//! │                                           │
//! │  create{name, frame, cache, endpoint}     │
//! │ ─────────────────────────────────────────>│
//! │                {cached}                   │
//! │<───────────────────────────────────────── │
//! │                                           │
//! │        iterAttributes / iterPoints        │
//! │<───────────────────────────────────────── │
//! │        stream of records                  │
//! │ ─────────────────────────────────────────>│
//! │                                           │
//! │            complete{name, cached}         │
//! │<───────────────────────────────────────── │
//! │                                           │
//! │  sync{name}                               │
//! │ ─────────────────────────────────────────>│
//! ```

pub mod proto {
    #![allow(missing_docs)]
    include!("proto/hyview.v1.rs");
}

pub mod app;
pub mod host;
pub mod logging;
pub mod transport;

pub use app::{App, BuildOptions, BuildState, Orchestrator};
pub use host::{CreateArgs, HostController};
pub use transport::{
    BoundServer, Connection, CreateReply, Dispatcher, GeometryClient, HostClient, Server,
    ServerHandle,
};
