//! Host side: the session manager answering requester calls.
//!
//! `create` does not block the requester's call on the transfer. It prepares
//! the node and spawns a pull task that reads geometry back from the
//! requester (or from a cache artifact), materializes it through the
//! [`SceneBuilder`], and then calls `complete` on the requester. A pull that
//! fails marks the node failed, so a requester polling `status` learns about
//! it even when the host cannot reach it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{Value, json};

use hyview::registry::parse_args;
use hyview::{
    AttributeDefinition, Config, Handler, Methods, NodeInspector, NodeStatus, PluginContext,
    Point, Result, SceneBuilder, cache, validate_name,
};

use crate::transport::{CreateReply, GeometryClient, method};

fn default_frame() -> i64 {
    1
}

fn default_cache() -> bool {
    true
}

/// Arguments of `create`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateArgs {
    /// Node name.
    pub name: String,
    /// Frame number of the cache artifact.
    #[serde(default = "default_frame")]
    pub frame: i64,
    /// Whether an existing cache artifact may be reused.
    #[serde(default = "default_cache")]
    pub cache: bool,
    /// Requester streaming endpoint. Falls back to the configured one.
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Deserialize)]
struct NameArgs {
    name: String,
}

/// Session manager for the host process.
pub struct HostController {
    builder: Arc<dyn SceneBuilder>,
    inspector: Arc<dyn NodeInspector>,
    cache_dir: PathBuf,
    requester: String,
}

impl std::fmt::Debug for HostController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostController")
            .field("cache_dir", &self.cache_dir)
            .field("requester", &self.requester)
            .finish_non_exhaustive()
    }
}

impl HostController {
    /// A controller over separate collaborators.
    pub fn new(
        builder: Arc<dyn SceneBuilder>,
        inspector: Arc<dyn NodeInspector>,
        config: &Config,
    ) -> Self {
        Self {
            builder,
            inspector,
            cache_dir: config.cache_dir.clone(),
            requester: config.requester_addr(),
        }
    }

    /// A controller over a scene implementing both collaborators.
    pub fn from_scene<S>(scene: Arc<S>, config: &Config) -> Self
    where
        S: SceneBuilder + NodeInspector + 'static,
    {
        Self::new(scene.clone(), scene, config)
    }

    /// Context handed to plugins loaded next to this controller.
    pub fn plugin_context(&self) -> PluginContext {
        PluginContext::new(self.builder.clone(), self.inspector.clone())
    }

    /// Prepare `name` and start pulling its geometry.
    pub async fn create(&self, args: CreateArgs) -> Result<CreateReply> {
        validate_name(&args.name)?;
        let path = cache::cache_path(&self.cache_dir, &args.name, args.frame);
        let cached = cache::resolve(&path, args.cache).await?;

        if self.inspector.destroy(&args.name).await {
            tracing::debug!(name = %args.name, "replaced existing node");
        }
        self.inspector.create(&args.name).await?;

        let endpoint = args.endpoint.unwrap_or_else(|| self.requester.clone());
        tracing::debug!(name = %args.name, frame = args.frame, cached, %endpoint, "creating node");
        tokio::spawn(pull(
            self.builder.clone(),
            self.inspector.clone(),
            args.name,
            path,
            cached,
            endpoint,
        ));
        Ok(CreateReply { cached })
    }

    /// Finalize `name` once the requester saw completion.
    pub async fn sync(&self, name: &str) -> Result<()> {
        self.inspector.finalize(name).await
    }

    /// Lifecycle state of `name`, `None` if there is no such node.
    pub async fn status(&self, name: &str) -> Option<NodeStatus> {
        self.inspector.status(name).await
    }

    /// Names of every node.
    pub async fn all_nodes(&self) -> Vec<String> {
        self.inspector.nodes().await
    }

    /// Destroy every node. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut removed = 0;
        for name in self.inspector.nodes().await {
            if self.inspector.destroy(&name).await {
                removed += 1;
            }
        }
        tracing::debug!(removed, "cleared nodes");
        removed
    }

    /// Built-in host methods.
    pub fn methods(self: &Arc<Self>) -> Result<Methods> {
        let create = self.clone();
        let sync = self.clone();
        let status = self.clone();
        let nodes = self.clone();
        let clear = self.clone();

        Methods::new()
            .with(
                method::CREATE,
                Handler::unary(move |args| {
                    let host = create.clone();
                    async move {
                        let args: CreateArgs = parse_args(method::CREATE, args)?;
                        Ok(serde_json::to_value(host.create(args).await?)?)
                    }
                }),
            )?
            .with(
                method::SYNC,
                Handler::unary(move |args| {
                    let host = sync.clone();
                    async move {
                        let args: NameArgs = parse_args(method::SYNC, args)?;
                        host.sync(&args.name).await?;
                        Ok(Value::Null)
                    }
                }),
            )?
            .with(
                method::STATUS,
                Handler::unary(move |args| {
                    let host = status.clone();
                    async move {
                        let args: NameArgs = parse_args(method::STATUS, args)?;
                        Ok(serde_json::to_value(host.status(&args.name).await)?)
                    }
                }),
            )?
            .with(
                method::ALL_NODES,
                Handler::unary(move |_| {
                    let host = nodes.clone();
                    async move { Ok(json!(host.all_nodes().await)) }
                }),
            )?
            .with(
                method::CLEAR,
                Handler::unary(move |_| {
                    let host = clear.clone();
                    async move {
                        host.clear().await;
                        Ok(Value::Null)
                    }
                }),
            )
    }
}

async fn pull(
    builder: Arc<dyn SceneBuilder>,
    inspector: Arc<dyn NodeInspector>,
    name: String,
    path: PathBuf,
    cached: bool,
    endpoint: String,
) {
    let client = match GeometryClient::connect(endpoint.clone()).await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(%name, %endpoint, error = %e, "cannot reach requester");
            record_failure(inspector.as_ref(), &name, &e.to_string()).await;
            return;
        }
    };

    match transfer(&client, builder.as_ref(), &name, &path, cached).await {
        Ok(count) => {
            tracing::debug!(%name, count, cached, "geometry materialized");
            if let Err(e) = client.complete(&name, cached).await {
                tracing::error!(%name, error = %e, "requester rejected completion");
                record_failure(inspector.as_ref(), &name, &e.to_string()).await;
            }
        }
        Err(e) => {
            tracing::error!(%name, error = %e, "pull failed");
            let message = e.to_string();
            record_failure(inspector.as_ref(), &name, &message).await;
            if let Err(e) = client.abort(&name, &message).await {
                tracing::error!(%name, error = %e, "could not report failed pull");
            }
        }
    }
}

async fn record_failure(inspector: &dyn NodeInspector, name: &str, message: &str) {
    if let Err(e) = inspector.fail(name, message).await {
        tracing::warn!(%name, error = %e, "could not mark node failed");
    }
}

async fn transfer(
    client: &GeometryClient,
    builder: &dyn SceneBuilder,
    name: &str,
    path: &Path,
    cached: bool,
) -> Result<usize> {
    if cached {
        return builder.load_cache(name, path).await;
    }

    let attributes: Vec<AttributeDefinition> = client
        .iter_attributes(name)
        .await?
        .and_then(|record| std::future::ready(AttributeDefinition::try_from(record)))
        .try_collect()
        .await?;
    let points = client
        .iter_points(name)
        .await?
        .map_ok(Point::from)
        .boxed();
    let count = builder.build(name, attributes, points).await?;
    builder.write_cache(name, path).await?;
    Ok(count)
}
