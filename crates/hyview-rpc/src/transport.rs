//! RPC transport between a requester and a host.
//!
//! Both processes serve the same gRPC service, `hyview.v1.Rpc`, which routes
//! a call to a handler from a [`Methods`] table by name. Arguments and
//! results travel as JSON. A handler error comes back as a [`Fault`] in the
//! reply; anything that goes wrong below that (refused connection, reset
//! stream, server gone) is an [`Error::Transport`].

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::ready;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

use hyview::{
    AttributeRecord, Error, Fault, Handler, HandlerKind, Methods, NodeStatus, PointRecord, Result,
};

use crate::proto::{
    self, CallReply, CallRequest, StreamChunk, call_reply::Outcome, rpc_client::RpcClient,
    rpc_server::RpcServer, stream_chunk::Payload,
};

/// Method names used between requester and host.
pub mod method {
    /// Sorted list of the methods a server exposes.
    pub const LIST: &str = "_list";
    /// Method name to `"unary"` or `"streaming"`.
    pub const INSPECT: &str = "_inspect";

    /// Host: create a node and start pulling geometry into it.
    pub const CREATE: &str = "create";
    /// Host: finalize a node after its build completed.
    pub const SYNC: &str = "sync";
    /// Host: lifecycle state of one node.
    pub const STATUS: &str = "status";
    /// Host: names of all nodes.
    pub const ALL_NODES: &str = "allNodes";
    /// Host: destroy all nodes.
    pub const CLEAR: &str = "clear";

    /// Requester: the host finished materializing a build.
    pub const COMPLETE: &str = "complete";
    /// Requester: the host gave up on a build.
    pub const ABORT: &str = "abort";
    /// Requester: stream the active build's attribute records.
    pub const ITER_ATTRIBUTES: &str = "iterAttributes";
    /// Requester: stream the active build's point records.
    pub const ITER_POINTS: &str = "iterPoints";
    /// Requester: name of the active build, or null.
    pub const ACTIVE_NAME: &str = "activeName";
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn fault_proto(fault: Fault) -> proto::Fault {
    proto::Fault {
        kind: fault.kind,
        message: fault.message,
    }
}

fn fault_from_proto(fault: proto::Fault) -> Fault {
    Fault::new(fault.kind, fault.message)
}

fn parse_json(text: &str) -> Result<Value> {
    if text.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(text)?)
}

fn status_error(status: Status) -> Error {
    Error::Transport(format!("{:?}: {}", status.code(), status.message()))
}

/// gRPC service routing calls into a [`Methods`] table.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    methods: Arc<Methods>,
}

impl Dispatcher {
    /// Dispatch onto `methods`.
    pub fn new(methods: Methods) -> Self {
        Self {
            methods: Arc::new(methods),
        }
    }

    /// Run a unary call.
    pub async fn dispatch(&self, name: &str, args: Value) -> std::result::Result<Value, Fault> {
        match name {
            method::LIST => return Ok(json!(self.methods.names())),
            method::INSPECT => {
                let kinds: BTreeMap<String, &str> = self
                    .methods
                    .kinds()
                    .into_iter()
                    .map(|(name, kind)| (name, kind.as_str()))
                    .collect();
                return Ok(json!(kinds));
            }
            _ => {}
        }
        match self.methods.get(name) {
            Some(Handler::Unary(f)) => f(args).await.map_err(Fault::from),
            Some(Handler::Streaming(_)) => Err(Fault::new(
                Fault::WRONG_SHAPE,
                format!("{name} is a streaming method"),
            )),
            None => Err(unknown_method(name)),
        }
    }

    /// Start a streaming call. The stream ends after the first fault.
    pub fn dispatch_stream(&self, name: &str, args: Value) -> BoxStream<'static, std::result::Result<Value, Fault>> {
        let items = match self.methods.get(name) {
            Some(Handler::Streaming(f)) => f(args),
            Some(Handler::Unary(_)) => {
                let fault = Fault::new(Fault::WRONG_SHAPE, format!("{name} is a unary method"));
                return stream::once(ready(Err(fault))).boxed();
            }
            None if name == method::LIST || name == method::INSPECT => {
                let fault = Fault::new(Fault::WRONG_SHAPE, format!("{name} is a unary method"));
                return stream::once(ready(Err(fault))).boxed();
            }
            None => return stream::once(ready(Err(unknown_method(name)))).boxed(),
        };
        items
            .map_err(Fault::from)
            .scan(false, |failed, item| {
                if *failed {
                    return ready(None);
                }
                *failed = item.is_err();
                ready(Some(item))
            })
            .boxed()
    }
}

fn unknown_method(name: &str) -> Fault {
    Fault::new(Fault::UNKNOWN_METHOD, format!("no method named {name:?}"))
}

#[tonic::async_trait]
impl proto::rpc_server::Rpc for Dispatcher {
    async fn call(&self, request: Request<CallRequest>) -> std::result::Result<Response<CallReply>, Status> {
        let CallRequest { method, args_json } = request.into_inner();
        tracing::trace!(%method, "call");
        let result = match parse_json(&args_json) {
            Ok(args) => self.dispatch(&method, args).await,
            Err(e) => Err(Fault::from(e)),
        };
        let outcome = match result {
            Ok(value) => Outcome::ValueJson(value.to_string()),
            Err(fault) => {
                tracing::debug!(%method, %fault, "call failed");
                Outcome::Fault(fault_proto(fault))
            }
        };
        Ok(Response::new(CallReply {
            outcome: Some(outcome),
        }))
    }

    type StreamStream = Pin<Box<dyn futures::Stream<Item = std::result::Result<StreamChunk, Status>> + Send>>;

    async fn stream(
        &self,
        request: Request<CallRequest>,
    ) -> std::result::Result<Response<Self::StreamStream>, Status> {
        let CallRequest { method, args_json } = request.into_inner();
        tracing::trace!(%method, "stream");
        let items = match parse_json(&args_json) {
            Ok(args) => self.dispatch_stream(&method, args),
            Err(e) => stream::once(ready(Err(Fault::from(e)))).boxed(),
        };
        let chunks = items.map(|item| {
            let payload = match item {
                Ok(value) => Payload::ItemJson(value.to_string()),
                Err(fault) => Payload::Fault(fault_proto(fault)),
            };
            Ok(StreamChunk {
                payload: Some(payload),
            })
        });
        Ok(Response::new(Box::pin(chunks) as Self::StreamStream))
    }
}

/// A method table waiting to be bound.
#[derive(Debug)]
pub struct Server {
    methods: Methods,
}

impl Server {
    /// Serve `methods`.
    pub fn new(methods: Methods) -> Self {
        Self { methods }
    }

    /// Reserve the listening port.
    pub async fn bind<A>(self, addr: A) -> Result<BoundServer>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Transport(format!("cannot bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        Ok(BoundServer {
            listener,
            local_addr,
            methods: self.methods,
        })
    }
}

/// A server holding its port, not yet accepting connections.
#[derive(Debug)]
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    methods: Methods,
}

impl BoundServer {
    /// Address actually bound, useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and dispatch calls until `shutdown` resolves, then release the
    /// port.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.local_addr;
        tracing::info!(%addr, methods = ?self.methods.names(), "starting RPC server");

        tonic::transport::Server::builder()
            .add_service(RpcServer::new(Dispatcher::new(self.methods)))
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), shutdown)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        tracing::info!(%addr, "RPC server shut down");
        Ok(())
    }

    /// Run until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run on a background task.
    pub fn spawn(self) -> ServerHandle {
        let local_addr = self.local_addr;
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async {
            let _ = rx.await;
        }));
        ServerHandle {
            local_addr,
            shutdown: Some(tx),
            task: Some(task),
        }
    }
}

/// Handle to a server running on a background task.
///
/// Dropping the handle stops the server without waiting for it.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting calls, wait for the server to wind down and release
    /// the port.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::Transport(format!("server task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

/// A channel to a remote [`Server`].
///
/// The channel closes when the connection is dropped or [`Connection::close`]d;
/// calls made after closing fail with a transport error.
#[derive(Debug)]
pub struct Connection {
    addr: String,
    client: Option<RpcClient<Channel>>,
}

impl Connection {
    /// Connect to `addr` (`host:port` or a full `http://` URI).
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let uri = if addr.contains("://") {
            addr.clone()
        } else {
            format!("http://{addr}")
        };
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| Error::Transport(format!("invalid address {addr:?}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::Transport(format!("cannot connect to {addr}: {e}")))?;
        tracing::debug!(%addr, "connected");
        Ok(Self {
            addr,
            client: Some(RpcClient::new(channel)),
        })
    }

    /// Address this connection was opened to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether [`Connection::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.client.is_none()
    }

    /// Close the channel.
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            tracing::debug!(addr = %self.addr, "connection closed");
        }
    }

    fn client(&self) -> Result<RpcClient<Channel>> {
        self.client
            .clone()
            .ok_or_else(|| Error::Transport(format!("connection to {} is closed", self.addr)))
    }

    fn request(method: &str, args: &Value) -> CallRequest {
        CallRequest {
            method: method.to_string(),
            args_json: args.to_string(),
        }
    }

    /// Call a unary method.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value> {
        let reply = self
            .client()?
            .call(Self::request(method, &args))
            .await
            .map_err(status_error)?
            .into_inner();
        match reply.outcome {
            Some(Outcome::ValueJson(text)) => parse_json(&text),
            Some(Outcome::Fault(fault)) => Err(Error::Remote(fault_from_proto(fault))),
            None => Err(Error::Transport(format!("empty reply to {method}"))),
        }
    }

    /// Call a unary method with typed arguments and result.
    pub async fn call_as<T, A>(&self, method: &str, args: A) -> Result<T>
    where
        T: DeserializeOwned,
        A: Serialize,
    {
        let value = self.call(method, serde_json::to_value(args)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call a streaming method.
    ///
    /// Items arrive in the order the handler produced them. A fault ends the
    /// stream with an [`Error::Remote`].
    pub async fn stream(&self, method: &str, args: Value) -> Result<BoxStream<'static, Result<Value>>> {
        let chunks = self
            .client()?
            .stream(Self::request(method, &args))
            .await
            .map_err(status_error)?
            .into_inner();
        let method = method.to_string();
        Ok(chunks
            .map(move |chunk| match chunk {
                Ok(StreamChunk {
                    payload: Some(Payload::ItemJson(text)),
                }) => parse_json(&text),
                Ok(StreamChunk {
                    payload: Some(Payload::Fault(fault)),
                }) => Err(Error::Remote(fault_from_proto(fault))),
                Ok(StreamChunk { payload: None }) => {
                    Err(Error::Transport(format!("empty chunk from {method}")))
                }
                Err(status) => Err(status_error(status)),
            })
            .boxed())
    }

    /// Call a streaming method, decoding each item.
    pub async fn stream_as<T>(&self, method: &str, args: Value) -> Result<BoxStream<'static, Result<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let items = self.stream(method, args).await?;
        Ok(items
            .and_then(|value| ready(serde_json::from_value(value).map_err(Error::from)))
            .boxed())
    }

    /// Names of the methods the remote side serves.
    pub async fn list_methods(&self) -> Result<Vec<String>> {
        self.call_as(method::LIST, Value::Null).await
    }

    /// Method names with their reply shapes.
    pub async fn inspect(&self) -> Result<BTreeMap<String, HandlerKind>> {
        let kinds: BTreeMap<String, String> = self.call_as(method::INSPECT, Value::Null).await?;
        Ok(kinds
            .into_iter()
            .map(|(name, kind)| {
                let kind = if kind == HandlerKind::Streaming.as_str() {
                    HandlerKind::Streaming
                } else {
                    HandlerKind::Unary
                };
                (name, kind)
            })
            .collect())
    }
}

/// Reply to the host's `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct CreateReply {
    /// Whether the host is reading an existing cache artifact instead of
    /// pulling geometry.
    pub cached: bool,
}

/// Requester-side view of the host.
#[derive(Debug)]
pub struct HostClient {
    conn: Connection,
}

impl HostClient {
    /// Connect to the host's control server.
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        Ok(Self {
            conn: Connection::connect(addr).await?,
        })
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Ask the host to create `name` and pull its geometry from `endpoint`.
    pub async fn create(
        &self,
        name: &str,
        frame: i64,
        cache: bool,
        endpoint: Option<&str>,
    ) -> Result<CreateReply> {
        let args = json!({
            "name": name,
            "frame": frame,
            "cache": cache,
            "endpoint": endpoint,
        });
        self.conn.call_as(method::CREATE, args).await
    }

    /// Finalize `name` after completion.
    pub async fn sync(&self, name: &str) -> Result<()> {
        self.conn.call(method::SYNC, json!({ "name": name })).await?;
        Ok(())
    }

    /// Names of the host's nodes.
    pub async fn all_nodes(&self) -> Result<Vec<String>> {
        self.conn.call_as(method::ALL_NODES, Value::Null).await
    }

    /// Destroy every node.
    pub async fn clear(&self) -> Result<()> {
        self.conn.call(method::CLEAR, Value::Null).await?;
        Ok(())
    }

    /// Lifecycle state of `name` on the host, `None` if it has no such node.
    pub async fn status(&self, name: &str) -> Result<Option<NodeStatus>> {
        self.conn
            .call_as(method::STATUS, json!({ "name": name }))
            .await
    }

    /// Close the connection.
    pub fn close(&mut self) {
        self.conn.close();
    }
}

/// Host-side view of the requester serving a build.
#[derive(Debug)]
pub struct GeometryClient {
    conn: Connection,
}

impl GeometryClient {
    /// Connect to the requester's streaming server.
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        Ok(Self {
            conn: Connection::connect(addr).await?,
        })
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Attribute records of the active build.
    pub async fn iter_attributes(&self, name: &str) -> Result<BoxStream<'static, Result<AttributeRecord>>> {
        self.conn
            .stream_as(method::ITER_ATTRIBUTES, json!({ "name": name }))
            .await
    }

    /// Point records of the active build.
    pub async fn iter_points(&self, name: &str) -> Result<BoxStream<'static, Result<PointRecord>>> {
        self.conn
            .stream_as(method::ITER_POINTS, json!({ "name": name }))
            .await
    }

    /// Signal that `name` is materialized. `cached` tells the requester the
    /// streams were skipped in favour of a cache artifact.
    pub async fn complete(&self, name: &str, cached: bool) -> Result<()> {
        self.conn
            .call(method::COMPLETE, json!({ "name": name, "cached": cached }))
            .await?;
        Ok(())
    }

    /// Give up on `name`.
    pub async fn abort(&self, name: &str, message: &str) -> Result<()> {
        self.conn
            .call(method::ABORT, json!({ "name": name, "message": message }))
            .await?;
        Ok(())
    }

    /// Name of the requester's active build.
    pub async fn active_name(&self) -> Result<Option<String>> {
        self.conn.call_as(method::ACTIVE_NAME, Value::Null).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures::stream;

    use super::*;

    fn methods() -> Methods {
        Methods::new()
            .with("echo", Handler::unary(|args| async move { Ok(args) }))
            .unwrap()
            .with(
                "fail",
                Handler::unary(|_| async { Err(Error::InvalidName("1bad".into())) }),
            )
            .unwrap()
            .with(
                "count",
                Handler::streaming(|_| {
                    stream::iter(vec![
                        Ok(json!(1)),
                        Err(Error::NoActiveBuild),
                        Ok(json!(3)),
                    ])
                }),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_shapes() {
        let dispatcher = Dispatcher::new(methods());

        assert_eq!(dispatcher.dispatch("echo", json!([1])).await.unwrap(), json!([1]));

        let fault = dispatcher.dispatch("count", Value::Null).await.unwrap_err();
        assert_eq!(fault.kind, Fault::WRONG_SHAPE);

        let fault = dispatcher.dispatch("missing", Value::Null).await.unwrap_err();
        assert_eq!(fault.kind, Fault::UNKNOWN_METHOD);

        let fault = dispatcher.dispatch("fail", Value::Null).await.unwrap_err();
        assert_eq!(fault.kind, "Validation");

        let items: Vec<_> = dispatcher.dispatch_stream("echo", Value::Null).collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().kind, Fault::WRONG_SHAPE);
    }

    #[tokio::test]
    async fn test_stream_stops_after_first_fault() {
        let dispatcher = Dispatcher::new(methods());
        let items: Vec<_> = dispatcher.dispatch_stream("count", Value::Null).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &json!(1));
        assert_eq!(items[1].as_ref().unwrap_err().kind, "State");
    }

    #[tokio::test]
    async fn test_introspection() {
        let dispatcher = Dispatcher::new(methods());
        assert_eq!(
            dispatcher.dispatch(method::LIST, Value::Null).await.unwrap(),
            json!(["count", "echo", "fail"])
        );
        assert_eq!(
            dispatcher.dispatch(method::INSPECT, Value::Null).await.unwrap(),
            json!({"count": "streaming", "echo": "unary", "fail": "unary"})
        );
    }

    #[tokio::test]
    async fn test_stop_releases_the_port() {
        let handle = Server::new(methods())
            .bind("127.0.0.1:0")
            .await
            .unwrap()
            .spawn();
        let addr = handle.local_addr();

        let conn = Connection::connect(addr.to_string()).await.unwrap();
        assert_eq!(conn.call("echo", json!("hi")).await.unwrap(), json!("hi"));
        drop(conn);
        handle.stop().await.unwrap();

        let rebound = Server::new(methods()).bind(addr).await.unwrap();
        assert_eq!(rebound.local_addr(), addr);
    }

    #[tokio::test]
    async fn test_calls_after_close_are_transport_errors() {
        let handle = Server::new(methods())
            .bind("127.0.0.1:0")
            .await
            .unwrap()
            .spawn();
        let mut conn = Connection::connect(handle.local_addr().to_string())
            .await
            .unwrap();
        assert!(!conn.is_closed());

        conn.close();
        assert!(conn.is_closed());
        assert!(conn.call("echo", Value::Null).await.unwrap_err().is_transport());
        assert!(
            conn.stream("count", Value::Null)
                .await
                .err()
                .unwrap()
                .is_transport()
        );

        handle.stop().await.unwrap();
    }
}
