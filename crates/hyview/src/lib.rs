//! hyview: stream geometry from any process into a long-running 3D host.
//!
//! A requester names a [`Geometry`] by content with a [`c4::Identifier`],
//! asks the host to create a node for it, and waits while the host pulls the
//! attributes and points back over RPC and signals completion. This crate
//! holds everything that is independent of the wire: identifiers, the data
//! model and its flattened records, the method registry and plugins, the
//! host-side collaborator traits, configuration and errors.
//!
//! The gRPC transport, the build orchestrator and the host controller live in
//! `hyview-rpc`.

pub mod c4;
pub mod cache;
pub mod config;
mod error;
pub mod geometry;
pub mod plugins;
pub mod record;
pub mod registry;
pub mod scene;

pub use c4::{C4, C4Error, Datum, Identifier};
pub use config::Config;
pub use error::{Error, ErrorKind, Fault, Result};
pub use geometry::{
    AttributeDefinition, AttributeDomain, Geometry, GeometryBody, Point, PointCursor, Primitive,
    validate_name,
};
pub use plugins::PluginContext;
pub use record::{AttributeRecord, PointRecord};
pub use registry::{Handler, HandlerKind, Methods, Registry, parse_args};
pub use scene::{MemoryScene, NodeInspector, NodeState, NodeStatus, SceneBuilder};
