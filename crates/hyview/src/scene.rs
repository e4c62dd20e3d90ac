//! Host-side collaborators.
//!
//! The host controller never touches a scene graph directly. It goes through
//! a [`SceneBuilder`], which turns pulled records into host-native geometry,
//! and a [`NodeInspector`], which manages the named nodes holding builds.
//! [`MemoryScene`] implements both without a 3D application behind it.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::geometry::{AttributeDefinition, Geometry, Point};

/// Materializes geometry inside the host.
#[async_trait]
pub trait SceneBuilder: Send + Sync {
    /// Create `attributes` in order, then one host point per streamed point,
    /// in stream order. Returns the number of points created.
    async fn build(
        &self,
        name: &str,
        attributes: Vec<AttributeDefinition>,
        points: BoxStream<'_, Result<Point>>,
    ) -> Result<usize>;

    /// Populate `name` from a cache artifact. Returns the number of points.
    async fn load_cache(&self, name: &str, path: &Path) -> Result<usize>;

    /// Write the geometry of `name` to a cache artifact.
    async fn write_cache(&self, name: &str, path: &Path) -> Result<()>;

    /// Apply a named post-build operation, e.g. meshing, to `name`.
    async fn apply(&self, name: &str, operation: &str, params: Value) -> Result<Value>;
}

/// Tracks the named nodes that hold builds.
#[async_trait]
pub trait NodeInspector: Send + Sync {
    /// Names of all nodes.
    async fn nodes(&self) -> Vec<String>;

    /// Create an empty node, replacing any node with the same name.
    async fn create(&self, name: &str) -> Result<()>;

    /// Destroy a node. Returns whether it existed.
    async fn destroy(&self, name: &str) -> bool;

    /// Drop the machinery used to stream into `name`, keeping the geometry.
    async fn finalize(&self, name: &str) -> Result<()>;

    /// Name of the last operation applied to `name`, if any.
    async fn last_operation(&self, name: &str) -> Option<String>;

    /// Record that materializing `name` failed.
    async fn fail(&self, name: &str, message: &str) -> Result<()>;

    /// Lifecycle state of `name`, or `None` for an unknown node.
    async fn status(&self, name: &str) -> Option<NodeStatus>;
}

/// Lifecycle of a [`SceneNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Created, waiting for geometry.
    Pending,
    /// Geometry materialized.
    Built,
    /// Finalized after completion.
    Synced,
    /// The host gave up materializing it.
    Failed,
}

/// What a host reports about one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Lifecycle state.
    pub state: NodeState,
    /// Why the node failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// An operation applied to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation name.
    pub name: String,
    /// Parameters it was applied with.
    pub params: Value,
}

/// A node of a [`MemoryScene`].
#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    /// Materialized geometry.
    pub geometry: Geometry,
    /// Where the node is in its lifecycle.
    pub state: NodeState,
    /// Operations applied so far, oldest first.
    pub operations: Vec<Operation>,
    /// Failure reported through [`NodeInspector::fail`].
    pub failure: Option<String>,
}

impl SceneNode {
    fn new() -> Self {
        Self {
            geometry: Geometry::default(),
            state: NodeState::Pending,
            operations: Vec::new(),
            failure: None,
        }
    }
}

/// In-memory scene.
#[derive(Debug, Default)]
pub struct MemoryScene {
    nodes: RwLock<BTreeMap<String, SceneNode>>,
}

impl MemoryScene {
    /// An empty scene.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a node.
    pub async fn node(&self, name: &str) -> Option<SceneNode> {
        self.nodes.read().await.get(name).cloned()
    }

    async fn with_node<T>(&self, name: &str, f: impl FnOnce(&mut SceneNode) -> T) -> Result<T> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
        Ok(f(node))
    }
}

#[async_trait]
impl SceneBuilder for MemoryScene {
    async fn build(
        &self,
        name: &str,
        attributes: Vec<AttributeDefinition>,
        points: BoxStream<'_, Result<Point>>,
    ) -> Result<usize> {
        let points: Vec<Point> = points.try_collect().await?;
        let count = points.len();
        let mut nodes = self.nodes.write().await;
        let node = nodes.entry(name.to_string()).or_insert_with(SceneNode::new);
        node.geometry = Geometry::from_points(attributes, points);
        node.state = NodeState::Built;
        tracing::debug!(node = name, points = count, "built geometry");
        Ok(count)
    }

    async fn load_cache(&self, name: &str, path: &Path) -> Result<usize> {
        let bytes = tokio::fs::read(path).await?;
        let geometry: Geometry = serde_json::from_slice(&bytes)?;
        let count = geometry.point_count();
        let mut nodes = self.nodes.write().await;
        let node = nodes.entry(name.to_string()).or_insert_with(SceneNode::new);
        node.geometry = geometry;
        node.state = NodeState::Built;
        tracing::debug!(node = name, path = %path.display(), "loaded cache artifact");
        Ok(count)
    }

    async fn write_cache(&self, name: &str, path: &Path) -> Result<()> {
        let bytes = {
            let nodes = self.nodes.read().await;
            let node = nodes
                .get(name)
                .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
            serde_json::to_vec(&node.geometry)?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn apply(&self, name: &str, operation: &str, params: Value) -> Result<Value> {
        self.with_node(name, |node| {
            node.operations.push(Operation {
                name: operation.to_string(),
                params,
            });
            json!({
                "node": name,
                "operation": operation,
                "points": node.geometry.point_count(),
            })
        })
        .await
    }
}

#[async_trait]
impl NodeInspector for MemoryScene {
    async fn nodes(&self) -> Vec<String> {
        self.nodes.read().await.keys().cloned().collect()
    }

    async fn create(&self, name: &str) -> Result<()> {
        self.nodes
            .write()
            .await
            .insert(name.to_string(), SceneNode::new());
        Ok(())
    }

    async fn destroy(&self, name: &str) -> bool {
        self.nodes.write().await.remove(name).is_some()
    }

    async fn finalize(&self, name: &str) -> Result<()> {
        self.with_node(name, |node| node.state = NodeState::Synced)
            .await
    }

    async fn last_operation(&self, name: &str) -> Option<String> {
        let nodes = self.nodes.read().await;
        nodes.get(name)?.operations.last().map(|op| op.name.clone())
    }

    async fn fail(&self, name: &str, message: &str) -> Result<()> {
        self.with_node(name, |node| {
            node.state = NodeState::Failed;
            node.failure = Some(message.to_string());
        })
        .await
    }

    async fn status(&self, name: &str) -> Option<NodeStatus> {
        let nodes = self.nodes.read().await;
        let node = nodes.get(name)?;
        Some(NodeStatus {
            state: node.state,
            message: node.failure.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures::StreamExt;
    use futures::stream;

    use super::*;
    use crate::geometry::AttributeDomain;

    fn points(n: usize) -> BoxStream<'static, Result<Point>> {
        stream::iter((0..n).map(|i| Ok(Point::new(i as f64, 0.0, 0.0)))).boxed()
    }

    #[tokio::test]
    async fn test_build_preserves_order() {
        let scene = MemoryScene::new();
        scene.create("foo").await.unwrap();
        let attrs = vec![AttributeDefinition::with_default("Cd", AttributeDomain::Point)];
        assert_eq!(scene.build("foo", attrs.clone(), points(3)).await.unwrap(), 3);

        let node = scene.node("foo").await.unwrap();
        assert_eq!(node.state, NodeState::Built);
        assert_eq!(node.geometry.attributes, attrs);
        let xs: Vec<f64> = node.geometry.points().map(|p| p.x).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_node_pending() {
        let scene = MemoryScene::new();
        scene.create("foo").await.unwrap();
        let broken = stream::iter(vec![
            Ok(Point::default()),
            Err(Error::Transport("reset".into())),
        ])
        .boxed();
        assert!(scene.build("foo", vec![], broken).await.is_err());
        assert_eq!(scene.node("foo").await.unwrap().state, NodeState::Pending);
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("foo.0001.json");

        let scene = MemoryScene::new();
        scene.build("foo", vec![], points(2)).await.unwrap();
        scene.write_cache("foo", &path).await.unwrap();

        let other = MemoryScene::new();
        assert_eq!(other.load_cache("foo", &path).await.unwrap(), 2);
        assert_eq!(
            other.node("foo").await.unwrap().geometry,
            scene.node("foo").await.unwrap().geometry
        );
    }

    #[tokio::test]
    async fn test_inspector() {
        let scene = MemoryScene::new();
        scene.create("b").await.unwrap();
        scene.create("a").await.unwrap();
        assert_eq!(scene.nodes().await, vec!["a", "b"]);

        assert!(scene.last_operation("a").await.is_none());
        scene.apply("a", "mesh", json!({"particlesep": 8})).await.unwrap();
        assert_eq!(scene.last_operation("a").await.as_deref(), Some("mesh"));

        scene.finalize("a").await.unwrap();
        assert_eq!(scene.node("a").await.unwrap().state, NodeState::Synced);
        assert!(matches!(
            scene.finalize("zzz").await,
            Err(Error::UnknownNode(_))
        ));

        assert!(scene.destroy("a").await);
        assert!(!scene.destroy("a").await);
        assert_eq!(scene.nodes().await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_failed_node_reports_status() {
        let scene = MemoryScene::new();
        assert!(scene.status("foo").await.is_none());
        scene.create("foo").await.unwrap();
        assert_eq!(
            scene.status("foo").await.unwrap(),
            NodeStatus {
                state: NodeState::Pending,
                message: None
            }
        );

        scene.fail("foo", "requester unreachable").await.unwrap();
        let status = scene.status("foo").await.unwrap();
        assert_eq!(status.state, NodeState::Failed);
        assert_eq!(status.message.as_deref(), Some("requester unreachable"));
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"state": "Failed", "message": "requester unreachable"})
        );

        // Re-creating the node clears the failure.
        scene.create("foo").await.unwrap();
        assert_eq!(scene.status("foo").await.unwrap().state, NodeState::Pending);
        assert!(matches!(
            scene.fail("zzz", "gone").await,
            Err(Error::UnknownNode(_))
        ));
    }
}
