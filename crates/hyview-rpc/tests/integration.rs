//! Integration tests for the requester/host protocol.
//!
//! Every test runs real gRPC servers on ephemeral loopback ports. The host is
//! either a `HostController` over a `MemoryScene` or a stub whose `create`
//! never pulls, which lets a test drive the requester's methods by hand.

#![allow(clippy::unwrap_used)] // unwrap is acceptable in tests

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::timeout;

use hyview::{
    AttributeDefinition, AttributeDomain, Config, Error, ErrorKind, Fault, Geometry, Handler,
    HandlerKind, MemoryScene, Methods, NodeInspector, NodeState, Point, Registry, plugins,
};
use hyview_rpc::transport::method;
use hyview_rpc::{
    App, BuildOptions, BuildState, Connection, GeometryClient, HostClient, HostController,
    Orchestrator, Server, ServerHandle,
};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("hyview_rpc=debug,hyview=debug")
            .with_test_writer()
            .init();
    });
}

/// Macro to log messages in tests (visible with --nocapture)
macro_rules! test_log {
    ($($arg:tt)*) => {
        eprintln!("[TEST] {}", format!($($arg)*));
    };
}

const WAIT: Duration = Duration::from_secs(10);

type Calls = Arc<Mutex<Vec<Value>>>;

fn recording(calls: &Calls, handler: Handler) -> Handler {
    let calls = calls.clone();
    match handler {
        Handler::Unary(f) => Handler::unary(move |args: Value| {
            calls.lock().unwrap().push(args.clone());
            f(args)
        }),
        streaming => streaming,
    }
}

fn sample() -> Geometry {
    Geometry::from_points(
        vec![AttributeDefinition::new(
            "Cd",
            AttributeDomain::Point,
            json!([0.1, 0.1, 0.1]),
        )],
        vec![
            Point::new(0.0, 0.0, 0.0).with_attr("Cd", json!([1.0, 0.0, 0.0])),
            Point::new(1.0, 2.0, 3.0).with_attr("Cd", json!([0.0, 1.0, 0.0])),
            Point::new(4.0, 5.0, 6.0).with_attr("Cd", json!([0.0, 0.0, 1.0])),
        ],
    )
}

/// Host backed by a `MemoryScene`, with `create` calls recorded.
struct RealHost {
    scene: Arc<MemoryScene>,
    handle: ServerHandle,
    creates: Calls,
    dir: TempDir,
}

impl RealHost {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(extend: impl FnOnce(&mut Registry)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let scene = Arc::new(MemoryScene::new());
        let controller = Arc::new(HostController::from_scene(scene.clone(), &config));
        let builtins = controller.methods().unwrap();

        let creates = Calls::default();
        let mut methods = Methods::new();
        for name in builtins.names() {
            let handler = builtins.get(&name).cloned().unwrap();
            let handler = if name == method::CREATE {
                recording(&creates, handler)
            } else {
                handler
            };
            methods.insert(name, handler).unwrap();
        }

        let mut registry = Registry::new();
        registry
            .load_paths([plugins::MESH_PLUGIN], &controller.plugin_context())
            .unwrap();
        extend(&mut registry);
        registry.merge_into(&mut methods).unwrap();

        let handle = Server::new(methods)
            .bind("127.0.0.1:0")
            .await
            .unwrap()
            .spawn();
        test_log!("host listening on {}", handle.local_addr());
        Self {
            scene,
            handle,
            creates,
            dir,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }
}

/// Host whose `create` records its arguments and never pulls. Its nodes
/// always report `Pending`.
struct StubHost {
    handle: ServerHandle,
    creates: Calls,
    syncs: Calls,
}

impl StubHost {
    async fn start(nodes: &[&str]) -> Self {
        let creates = Calls::default();
        let syncs = Calls::default();
        let nodes = json!(nodes);

        let methods = Methods::new()
            .with(
                method::CREATE,
                recording(
                    &creates,
                    Handler::unary(|_| async { Ok(json!({"cached": false})) }),
                ),
            )
            .unwrap()
            .with(
                method::SYNC,
                recording(&syncs, Handler::unary(|_| async { Ok(Value::Null) })),
            )
            .unwrap()
            .with(
                method::STATUS,
                Handler::unary(|_| async { Ok(json!({"state": "Pending"})) }),
            )
            .unwrap()
            .with(
                method::ALL_NODES,
                Handler::unary(move |_| {
                    let nodes = nodes.clone();
                    async move { Ok(nodes) }
                }),
            )
            .unwrap()
            .with(
                method::CLEAR,
                Handler::unary(|_| async { Ok(Value::Null) }),
            )
            .unwrap();

        let handle = Server::new(methods)
            .bind("127.0.0.1:0")
            .await
            .unwrap()
            .spawn();
        Self {
            handle,
            creates,
            syncs,
        }
    }
}

fn requester_config(host: SocketAddr, cache_dir: &Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        app_port: host.port(),
        cache_dir: cache_dir.to_path_buf(),
        heartbeat: Duration::from_millis(100),
        ..Config::default()
    }
}

async fn start_app(host: SocketAddr) -> Arc<App> {
    let dir = std::env::temp_dir();
    Arc::new(App::start(&requester_config(host, &dir)).await.unwrap())
}

fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn wait_for(orchestrator: &Orchestrator, state: BuildState) {
    timeout(WAIT, async {
        while orchestrator.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn spawn_build(
    app: &Arc<App>,
    geometry: Geometry,
    options: BuildOptions,
) -> tokio::task::JoinHandle<hyview::Result<String>> {
    let app = app.clone();
    tokio::spawn(async move { app.build(geometry, options).await })
}

async fn stop(app: Arc<App>) {
    Arc::try_unwrap(app).unwrap().stop().await.unwrap();
}

#[tokio::test]
async fn test_build_named_session() {
    init_tracing();
    let host = RealHost::start().await;
    let app = start_app(host.addr()).await;

    let name = timeout(WAIT, app.build(sample(), BuildOptions::named("foo")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "foo");
    assert_eq!(app.orchestrator().state(), BuildState::Idle);
    assert!(app.orchestrator().active_name().is_none());

    let creates = host.creates.lock().unwrap().clone();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0]["name"], "foo");
    assert_eq!(creates[0]["frame"], 1);
    assert_eq!(creates[0]["cache"], true);
    assert_eq!(creates[0]["endpoint"], app.endpoint());

    let node = host.scene.node("foo").await.unwrap();
    assert_eq!(node.state, NodeState::Synced);
    assert_eq!(node.geometry.attributes, sample().attributes);
    let positions: Vec<_> = node.geometry.points().map(Point::pos).collect();
    assert_eq!(
        positions,
        vec![(0.0, 0.0, 0.0), (1.0, 2.0, 3.0), (4.0, 5.0, 6.0)]
    );
    assert!(host.dir.path().join("foo.0001.json").exists());

    stop(app).await;
}

#[tokio::test]
async fn test_build_defaults_to_content_identifier() {
    init_tracing();
    let host = RealHost::start().await;
    let app = start_app(host.addr()).await;

    let geometry = sample();
    let expected = geometry.identifier().unwrap().to_string();
    let name = timeout(WAIT, app.build(geometry, BuildOptions::default()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, expected);
    assert!(name.starts_with("c4"));
    assert_eq!(name.len(), 90);
    assert_eq!(host.scene.nodes().await, vec![expected]);

    stop(app).await;
}

#[tokio::test]
async fn test_invalid_name_never_reaches_host() {
    init_tracing();
    let host = RealHost::start().await;
    let app = start_app(host.addr()).await;

    let err = app
        .build(sample(), BuildOptions::named("1bad"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(host.creates.lock().unwrap().is_empty());
    assert_eq!(app.orchestrator().state(), BuildState::Idle);

    stop(app).await;
}

#[tokio::test]
async fn test_non_finite_geometry_never_reaches_host() {
    init_tracing();
    let host = RealHost::start().await;
    let app = start_app(host.addr()).await;

    let nan = Geometry::from_points(vec![], vec![Point::new(f64::NAN, 0.0, 0.0)]);
    let err = app
        .build(nan, BuildOptions::named("foo"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidGeometry(_)));

    let inf = Geometry::from_points(vec![], vec![Point::new(0.0, 0.0, f64::NEG_INFINITY)]);
    let err = app.build(inf, BuildOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(host.creates.lock().unwrap().is_empty());
    assert_eq!(app.orchestrator().state(), BuildState::Idle);

    stop(app).await;
}

#[tokio::test]
async fn test_host_that_cannot_reach_requester_fails_the_build() {
    init_tracing();
    let host = RealHost::start().await;
    let client = HostClient::connect(host.addr().to_string()).await.unwrap();
    let orchestrator = Orchestrator::new(Duration::from_millis(100));
    let endpoint = closed_port().to_string();

    let err = timeout(
        WAIT,
        orchestrator.build(&client, &endpoint, sample(), BuildOptions::named("foo")),
    )
    .await
    .unwrap()
    .unwrap_err();
    test_log!("unreachable endpoint -> {err}");
    assert!(matches!(
        err,
        Error::Remote(ref f) if f.kind == Fault::ABORTED && f.message.contains("cannot connect")
    ));
    assert_eq!(orchestrator.state(), BuildState::Idle);
    assert_eq!(
        host.scene.status("foo").await.unwrap().state,
        NodeState::Failed
    );

    // The slot is free again for the next build.
    timeout(
        WAIT,
        orchestrator.build(&client, &endpoint, sample(), BuildOptions::named("bar")),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(orchestrator.state(), BuildState::Idle);
}

#[tokio::test]
async fn test_second_build_while_active_is_rejected() {
    init_tracing();
    let host = StubHost::start(&[]).await;
    let app = start_app(host.handle.local_addr()).await;

    let first = spawn_build(&app, sample(), BuildOptions::named("foo"));
    wait_for(app.orchestrator(), BuildState::AwaitingCompletion).await;

    let err = app
        .build(sample(), BuildOptions::named("bar"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BuildActive(ref active) if active == "foo"));
    assert_eq!(host.creates.lock().unwrap().len(), 1);

    app.orchestrator().complete("foo", true).unwrap();
    let name = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    assert_eq!(name, "foo");
    assert_eq!(host.syncs.lock().unwrap().clone(), vec![json!({"name": "foo"})]);
    assert_eq!(app.orchestrator().state(), BuildState::Idle);

    stop(app).await;
}

#[tokio::test]
async fn test_duplicate_host_session_is_rejected() {
    init_tracing();
    let host = StubHost::start(&["foo"]).await;
    let app = start_app(host.handle.local_addr()).await;

    let err = app
        .build(sample(), BuildOptions::named("foo"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateBuild(ref n) if n == "foo"));
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(host.creates.lock().unwrap().is_empty());
    assert_eq!(app.orchestrator().state(), BuildState::Idle);

    stop(app).await;
}

#[tokio::test]
async fn test_requester_streams_records_in_order() {
    init_tracing();
    let host = StubHost::start(&[]).await;
    let app = start_app(host.handle.local_addr()).await;

    let build = spawn_build(&app, sample(), BuildOptions::named("foo"));
    wait_for(app.orchestrator(), BuildState::AwaitingCompletion).await;

    let client = GeometryClient::connect(app.endpoint()).await.unwrap();
    assert_eq!(client.active_name().await.unwrap().as_deref(), Some("foo"));

    let attributes: Vec<_> = client
        .iter_attributes("foo")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(attributes.len(), 1);
    assert_eq!(attributes[0].name, "Cd");
    assert_eq!(attributes[0].kind, "Point");
    assert_eq!(attributes[0].default, json!([0.1, 0.1, 0.1]));

    let points: Vec<_> = client
        .iter_points("foo")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let xs: Vec<f64> = points.iter().map(|p| p.x).collect();
    assert_eq!(xs, vec![0.0, 1.0, 4.0]);
    assert_eq!(points[1].attrs["Cd"], json!([0.0, 1.0, 0.0]));

    client.complete("foo", false).await.unwrap();
    assert_eq!(timeout(WAIT, build).await.unwrap().unwrap().unwrap(), "foo");

    // The payload is released once the build completes.
    let err = match client.iter_points("foo").await {
        Ok(items) => items.try_collect::<Vec<_>>().await.unwrap_err(),
        Err(e) => e,
    };
    assert!(matches!(err, Error::Remote(ref f) if f.kind == "State"));

    stop(app).await;
}

#[tokio::test]
async fn test_complete_before_drain_fails_the_build() {
    init_tracing();
    let host = StubHost::start(&[]).await;
    let app = start_app(host.handle.local_addr()).await;

    let build = spawn_build(&app, sample(), BuildOptions::named("foo"));
    wait_for(app.orchestrator(), BuildState::AwaitingCompletion).await;

    let client = GeometryClient::connect(app.endpoint()).await.unwrap();
    let _: Vec<_> = client
        .iter_attributes("foo")
        .await
        .unwrap()
        .collect()
        .await;

    let err = client.complete("foo", false).await.unwrap_err();
    assert!(matches!(err, Error::Remote(ref f) if f.kind == "State"));

    let err = timeout(WAIT, build).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::ContractViolation { ref name, .. } if name == "foo"));
    assert!(host.syncs.lock().unwrap().is_empty());
    assert_eq!(app.orchestrator().state(), BuildState::Idle);

    // A second complete for the cleared session is ignored.
    client.complete("foo", false).await.unwrap();

    stop(app).await;
}

#[tokio::test]
async fn test_abort_surfaces_host_failure() {
    init_tracing();
    let host = StubHost::start(&[]).await;
    let app = start_app(host.handle.local_addr()).await;

    let build = spawn_build(&app, sample(), BuildOptions::named("foo"));
    wait_for(app.orchestrator(), BuildState::AwaitingCompletion).await;

    let client = GeometryClient::connect(app.endpoint()).await.unwrap();
    client.abort("foo", "scene is read-only").await.unwrap();

    let err = timeout(WAIT, build).await.unwrap().unwrap().unwrap_err();
    assert_eq!(
        err.to_string(),
        Error::Remote(Fault::new(Fault::ABORTED, "scene is read-only")).to_string()
    );
    assert_eq!(app.orchestrator().state(), BuildState::Idle);

    stop(app).await;
}

#[tokio::test]
async fn test_lost_host_surfaces_transport_error() {
    init_tracing();
    let host = StubHost::start(&[]).await;
    let app = start_app(host.handle.local_addr()).await;

    let build = spawn_build(&app, sample(), BuildOptions::named("foo"));
    wait_for(app.orchestrator(), BuildState::AwaitingCompletion).await;

    test_log!("stopping host while the build waits");
    drop(host);

    let err = timeout(WAIT, build).await.unwrap().unwrap().unwrap_err();
    assert!(err.is_transport(), "unexpected error: {err}");
    assert_eq!(app.orchestrator().state(), BuildState::AwaitingCompletion);

    app.orchestrator().reset();
    assert_eq!(app.orchestrator().state(), BuildState::Idle);

    stop(app).await;
}

#[tokio::test]
async fn test_cache_hit_skips_streaming() {
    init_tracing();
    let host = RealHost::start().await;
    let app = start_app(host.addr()).await;

    timeout(WAIT, app.build(sample(), BuildOptions::named("foo")))
        .await
        .unwrap()
        .unwrap();
    app.host().clear().await.unwrap();
    assert!(host.scene.nodes().await.is_empty());

    // Different payload, same name: the artifact wins.
    let other = Geometry::from_points(vec![], vec![Point::new(9.0, 9.0, 9.0)]);
    timeout(WAIT, app.build(other, BuildOptions::named("foo")))
        .await
        .unwrap()
        .unwrap();
    let node = host.scene.node("foo").await.unwrap();
    assert_eq!(node.geometry.point_count(), 3);

    // Without the cache the artifact is replaced.
    app.host().clear().await.unwrap();
    let other = Geometry::from_points(vec![], vec![Point::new(9.0, 9.0, 9.0)]);
    let options = BuildOptions {
        cache: false,
        ..BuildOptions::named("foo")
    };
    timeout(WAIT, app.build(other, options)).await.unwrap().unwrap();
    let node = host.scene.node("foo").await.unwrap();
    assert_eq!(node.geometry.point_count(), 1);

    stop(app).await;
}

#[tokio::test]
async fn test_registry_methods_over_the_wire() {
    init_tracing();
    let host = RealHost::start_with(|registry| {
        registry
            .register(
                "double",
                Handler::unary(|args| async move {
                    let n = args["n"].as_i64().unwrap_or_default();
                    Ok(json!(n * 2))
                }),
            )
            .unwrap();
        registry
            .register(
                "count",
                Handler::streaming(|args| {
                    let n = args["n"].as_u64().unwrap_or_default();
                    stream::iter((0..n).map(|i| Ok(json!(i))))
                }),
            )
            .unwrap();
    })
    .await;
    let conn = Connection::connect(host.addr().to_string()).await.unwrap();

    assert_eq!(conn.call("double", json!({"n": 21})).await.unwrap(), json!(42));
    let counted: Vec<Value> = conn
        .stream("count", json!({"n": 3}))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(counted, vec![json!(0), json!(1), json!(2)]);

    let err = conn.call("count", json!({"n": 3})).await.unwrap_err();
    assert!(matches!(err, Error::Remote(ref f) if f.kind == Fault::WRONG_SHAPE));
    let err = conn.call("triple", Value::Null).await.unwrap_err();
    assert!(matches!(err, Error::Remote(ref f) if f.kind == Fault::UNKNOWN_METHOD));
    let err = conn.call(method::CREATE, json!({"frame": 1})).await.unwrap_err();
    assert!(matches!(err, Error::Remote(ref f) if f.kind == "Validation"));

    // Plugin commands run against the same scene.
    let app = start_app(host.addr()).await;
    timeout(WAIT, app.build(sample(), BuildOptions::named("foo")))
        .await
        .unwrap()
        .unwrap();
    let applied = conn.call("mesh_all", Value::Null).await.unwrap();
    assert_eq!(applied["applied"], json!(["foo"]));
    let applied = conn.call("mesh_all", Value::Null).await.unwrap();
    assert_eq!(applied["applied"], json!([]));
    assert_eq!(
        host.scene.last_operation("foo").await.as_deref(),
        Some("particlefluidsurface")
    );

    stop(app).await;
}

#[tokio::test]
async fn test_registry_rejects_builtin_names() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        cache_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let controller = Arc::new(HostController::from_scene(
        Arc::new(MemoryScene::new()),
        &config,
    ));
    let mut methods = controller.methods().unwrap();

    let mut registry = Registry::new();
    registry
        .register(method::CREATE, Handler::unary(|_| async { Ok(Value::Null) }))
        .unwrap();
    let err = registry.merge_into(&mut methods).unwrap_err();
    assert!(matches!(err, Error::DuplicateMethod(ref n) if n == method::CREATE));
    assert_eq!(methods.len(), 4);
}

#[tokio::test]
async fn test_introspection_lists_both_sides() {
    init_tracing();
    let host = RealHost::start().await;
    let conn = Connection::connect(host.addr().to_string()).await.unwrap();

    let names = conn.list_methods().await.unwrap();
    for expected in [
        method::ALL_NODES,
        method::CLEAR,
        method::CREATE,
        "mesh_all",
        method::STATUS,
        method::SYNC,
    ] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);

    let app = start_app(host.addr()).await;
    let requester = Connection::connect(app.endpoint()).await.unwrap();
    let kinds = requester.inspect().await.unwrap();
    assert_eq!(kinds[method::COMPLETE], HandlerKind::Unary);
    assert_eq!(kinds[method::ABORT], HandlerKind::Unary);
    assert_eq!(kinds[method::ITER_ATTRIBUTES], HandlerKind::Streaming);
    assert_eq!(kinds[method::ITER_POINTS], HandlerKind::Streaming);
    assert_eq!(kinds[method::ACTIVE_NAME], HandlerKind::Unary);

    drop(requester);
    stop(app).await;
}

#[tokio::test]
async fn test_unreachable_host_is_a_transport_error() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let err = App::start(&requester_config(closed_port(), dir.path()))
        .await
        .unwrap_err();
    assert!(err.is_transport(), "unexpected error: {err}");
}
