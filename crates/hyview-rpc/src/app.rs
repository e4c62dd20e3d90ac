//! Requester side: the single-build orchestrator and the application object
//! tying it to a host.
//!
//! A build moves through `Idle -> Building -> AwaitingCompletion -> Idle`.
//! The orchestrator owns the one build slot. [`Orchestrator::build`] reserves
//! it, asks the host to create the node, and waits until the host calls
//! `complete` (served from the requester's own RPC server on another task).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use hyview::registry::parse_args;
use hyview::{
    AttributeRecord, Config, Error, Fault, Geometry, Handler, Methods, NodeState, NodeStatus,
    PointCursor, PointRecord, Result, validate_name,
};

use crate::transport::{HostClient, Server, ServerHandle, method};

/// Where the build slot is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// No build in flight.
    Idle,
    /// Slot reserved, host not yet told to create the node.
    Building,
    /// Host is materializing the geometry.
    AwaitingCompletion,
}

/// Options for a single build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Node name. Defaults to the geometry's content identifier.
    pub name: Option<String>,
    /// Frame the cache artifact is written for.
    pub frame: i64,
    /// Reuse an existing cache artifact.
    pub cache: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            name: None,
            frame: 1,
            cache: true,
        }
    }
}

impl BuildOptions {
    /// Build under an explicit name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

struct Session {
    name: String,
    geometry: Arc<Geometry>,
    done: Option<oneshot::Sender<Result<()>>>,
    attributes_drained: bool,
    points_drained: bool,
}

struct Slot {
    state: BuildState,
    /// Ticket and name of the build holding the slot.
    owner: Option<(u64, String)>,
    next_ticket: u64,
    session: Option<Session>,
}

impl Slot {
    fn owns(&self, ticket: u64) -> bool {
        matches!(&self.owner, Some((owner, _)) if *owner == ticket)
    }
}

#[derive(Clone, Copy)]
enum Drain {
    Attributes,
    Points,
}

/// Owner of the single build slot.
///
/// Cloning is cheap and every clone shares the slot, so the same orchestrator
/// can back the RPC methods and the caller of [`Orchestrator::build`].
#[derive(Clone)]
pub struct Orchestrator {
    slot: Arc<Mutex<Slot>>,
    heartbeat: Duration,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("active", &self.active_name())
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl Orchestrator {
    /// An idle orchestrator probing the host every `heartbeat` while a
    /// build waits. A zero interval disables probing.
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                state: BuildState::Idle,
                owner: None,
                next_ticket: 0,
                session: None,
            })),
            heartbeat,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    pub fn state(&self) -> BuildState {
        self.slot().state
    }

    /// Name of the build holding the slot, while its payload is still
    /// attached.
    pub fn active_name(&self) -> Option<String> {
        self.slot().session.as_ref().map(|s| s.name.clone())
    }

    /// Force the slot back to `Idle`, failing any waiting build.
    ///
    /// For embedders that would rather recover than restart after a
    /// transport failure left the slot in `AwaitingCompletion`.
    pub fn reset(&self) {
        let mut slot = self.slot();
        if let Some(mut session) = slot.session.take()
            && let Some(done) = session.done.take()
        {
            let _ = done.send(Err(Error::Transport("build was reset".into())));
        }
        slot.owner = None;
        slot.state = BuildState::Idle;
    }

    /// Build `geometry` on the host and wait for the host to finish.
    ///
    /// `endpoint` is where the host reaches this process's streaming server.
    /// Returns the name the build ran under.
    ///
    /// Validation and state errors, and transport errors before the wait,
    /// leave the orchestrator `Idle`. While waiting, the host's status for
    /// `name` is polled every heartbeat; a node the host marked failed (or
    /// lost) fails the build. A transport error during the wait leaves the
    /// orchestrator `AwaitingCompletion` until [`Orchestrator::reset`].
    pub async fn build(
        &self,
        host: &HostClient,
        endpoint: &str,
        geometry: Geometry,
        options: BuildOptions,
    ) -> Result<String> {
        geometry.validate()?;
        let name = match options.name {
            Some(name) => name,
            None => geometry.identifier()?.to_string(),
        };
        validate_name(&name)?;

        let (mut reservation, done) = self.reserve(&name, geometry)?;
        tracing::debug!(%name, frame = options.frame, cache = options.cache, "build started");

        if host.all_nodes().await?.contains(&name) {
            return Err(Error::DuplicateBuild(name));
        }

        let reply = host
            .create(&name, options.frame, options.cache, Some(endpoint))
            .await?;
        self.advance(reservation.ticket, BuildState::AwaitingCompletion)?;
        tracing::debug!(%name, cached = reply.cached, "awaiting completion");

        let outcome = match self.wait(host, &name, done).await {
            Ok(outcome) => outcome,
            Err(e) => {
                reservation.disarm();
                tracing::error!(%name, error = %e, "lost the host while awaiting completion");
                return Err(e);
            }
        };
        outcome?;

        host.sync(&name).await?;
        tracing::debug!(%name, "build complete");
        Ok(name)
    }

    fn reserve(
        &self,
        name: &str,
        geometry: Geometry,
    ) -> Result<(Reservation<'_>, oneshot::Receiver<Result<()>>)> {
        let mut slot = self.slot();
        if slot.state != BuildState::Idle {
            let active = slot
                .owner
                .as_ref()
                .map(|(_, name)| name.clone())
                .unwrap_or_default();
            return Err(Error::BuildActive(active));
        }
        let (tx, rx) = oneshot::channel();
        let ticket = slot.next_ticket;
        slot.next_ticket += 1;
        slot.owner = Some((ticket, name.to_string()));
        slot.state = BuildState::Building;
        slot.session = Some(Session {
            name: name.to_string(),
            geometry: Arc::new(geometry),
            done: Some(tx),
            attributes_drained: false,
            points_drained: false,
        });
        Ok((
            Reservation {
                orchestrator: self,
                ticket,
                armed: true,
            },
            rx,
        ))
    }

    /// Move the slot on, unless a reset handed it to another build.
    fn advance(&self, ticket: u64, state: BuildState) -> Result<()> {
        let mut slot = self.slot();
        if !slot.owns(ticket) {
            return Err(Error::Transport("build was reset".into()));
        }
        slot.state = state;
        Ok(())
    }

    /// Wait for the completion signal. The outer error is a lost host, the
    /// inner one is how the build ended.
    async fn wait(
        &self,
        host: &HostClient,
        name: &str,
        mut done: oneshot::Receiver<Result<()>>,
    ) -> Result<Result<()>> {
        loop {
            let tick = async {
                if self.heartbeat.is_zero() {
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(self.heartbeat).await;
            };
            tokio::select! {
                signal = &mut done => {
                    return Ok(signal.unwrap_or_else(|_| {
                        Err(Error::Transport("build was abandoned".into()))
                    }));
                }
                () = tick => {
                    if let Some(failure) = host_failure(name, host.status(name).await?) {
                        tracing::warn!(%name, error = %failure, "host reported the build failed");
                        return Ok(Err(failure));
                    }
                }
            }
        }
    }

    /// Signal that the host finished `name`.
    ///
    /// Unknown or stale names are ignored. Completing before both record
    /// streams were drained, unless the host read a cache artifact instead,
    /// fails the build.
    pub fn complete(&self, name: &str, cached: bool) -> Result<()> {
        let mut slot = self.slot();
        let Some(mut session) = slot.session.take_if(|s| s.name == name) else {
            tracing::warn!(%name, "ignoring complete for a build that is not active");
            return Ok(());
        };
        let done = session.done.take();

        let mut pending = Vec::new();
        if !cached && !session.attributes_drained {
            pending.push(method::ITER_ATTRIBUTES);
        }
        if !cached && !session.points_drained {
            pending.push(method::ITER_POINTS);
        }
        let violation = || Error::ContractViolation {
            name: name.to_string(),
            message: format!("draining {}", pending.join(" and ")),
        };

        let (outcome, reply) = if pending.is_empty() {
            (Ok(()), Ok(()))
        } else {
            tracing::warn!(%name, ?pending, "complete arrived before the streams were drained");
            (Err(violation()), Err(violation()))
        };
        if let Some(done) = done {
            let _ = done.send(outcome);
        }
        reply
    }

    /// The host could not materialize `name`.
    pub fn abort(&self, name: &str, message: &str) -> Result<()> {
        let mut slot = self.slot();
        let Some(mut session) = slot.session.take_if(|s| s.name == name) else {
            tracing::warn!(%name, "ignoring abort for a build that is not active");
            return Ok(());
        };
        tracing::warn!(%name, %message, "host aborted build");
        if let Some(done) = session.done.take() {
            let _ = done.send(Err(Error::Remote(Fault::new(Fault::ABORTED, message))));
        }
        Ok(())
    }

    fn payload(&self, name: Option<&str>) -> Result<(String, Arc<Geometry>)> {
        let slot = self.slot();
        let session = slot.session.as_ref().ok_or(Error::NoActiveBuild)?;
        if let Some(name) = name
            && name != session.name
        {
            return Err(Error::NoActiveBuild);
        }
        Ok((session.name.clone(), session.geometry.clone()))
    }

    fn mark_drained(&self, name: &str, which: Drain) {
        let mut slot = self.slot();
        if let Some(session) = slot.session.as_mut().filter(|s| s.name == name) {
            match which {
                Drain::Attributes => session.attributes_drained = true,
                Drain::Points => session.points_drained = true,
            }
        }
    }

    /// Attribute records of the active build, in definition order.
    pub fn iter_attributes(&self, name: Option<&str>) -> Result<BoxStream<'static, Result<Value>>> {
        let (name, geometry) = self.payload(name)?;
        let orchestrator = self.clone();
        Ok(stream::unfold(0usize, move |index| {
            let item = geometry.attributes.get(index).map(|def| {
                serde_json::to_value(AttributeRecord::from(def)).map_err(Error::from)
            });
            if item.is_none() {
                orchestrator.mark_drained(&name, Drain::Attributes);
            }
            std::future::ready(item.map(|item| (item, index + 1)))
        })
        .boxed())
    }

    /// Point records of the active build, in point order.
    pub fn iter_points(&self, name: Option<&str>) -> Result<BoxStream<'static, Result<Value>>> {
        let (name, geometry) = self.payload(name)?;
        let orchestrator = self.clone();
        Ok(stream::unfold(PointCursor::default(), move |mut cursor| {
            let item = geometry.next_point(&mut cursor).map(|point| {
                serde_json::to_value(PointRecord::from(point)).map_err(Error::from)
            });
            if item.is_none() {
                orchestrator.mark_drained(&name, Drain::Points);
            }
            std::future::ready(item.map(|item| (item, cursor)))
        })
        .boxed())
    }

    /// Built-in requester methods.
    pub fn methods(&self) -> Result<Methods> {
        #[derive(Deserialize)]
        struct CompleteArgs {
            name: String,
            #[serde(default)]
            cached: bool,
        }

        #[derive(Deserialize)]
        struct AbortArgs {
            name: String,
            #[serde(default)]
            message: String,
        }

        #[derive(Deserialize)]
        struct StreamArgs {
            #[serde(default)]
            name: Option<String>,
        }

        let complete = self.clone();
        let abort = self.clone();
        let attributes = self.clone();
        let points = self.clone();
        let active = self.clone();

        Methods::new()
            .with(
                method::COMPLETE,
                Handler::unary(move |args| {
                    let orchestrator = complete.clone();
                    async move {
                        let args: CompleteArgs = parse_args(method::COMPLETE, args)?;
                        orchestrator.complete(&args.name, args.cached)?;
                        Ok(Value::Null)
                    }
                }),
            )?
            .with(
                method::ABORT,
                Handler::unary(move |args| {
                    let orchestrator = abort.clone();
                    async move {
                        let args: AbortArgs = parse_args(method::ABORT, args)?;
                        orchestrator.abort(&args.name, &args.message)?;
                        Ok(Value::Null)
                    }
                }),
            )?
            .with(
                method::ITER_ATTRIBUTES,
                Handler::streaming(move |args| {
                    let opened = parse_args::<StreamArgs>(method::ITER_ATTRIBUTES, args)
                        .and_then(|args| attributes.iter_attributes(args.name.as_deref()));
                    open_or_fail(opened)
                }),
            )?
            .with(
                method::ITER_POINTS,
                Handler::streaming(move |args| {
                    let opened = parse_args::<StreamArgs>(method::ITER_POINTS, args)
                        .and_then(|args| points.iter_points(args.name.as_deref()));
                    open_or_fail(opened)
                }),
            )?
            .with(
                method::ACTIVE_NAME,
                Handler::unary(move |_| {
                    let name = active.active_name();
                    async move { Ok(json!(name)) }
                }),
            )
    }
}

fn host_failure(name: &str, status: Option<NodeStatus>) -> Option<Error> {
    match status {
        None => Some(Error::UnknownNode(name.to_string())),
        Some(status) if status.state == NodeState::Failed => Some(Error::Remote(Fault::new(
            Fault::ABORTED,
            status.message.unwrap_or_default(),
        ))),
        Some(_) => None,
    }
}

fn open_or_fail(opened: Result<BoxStream<'static, Result<Value>>>) -> BoxStream<'static, Result<Value>> {
    match opened {
        Ok(items) => items,
        Err(e) => stream::once(std::future::ready(Err(e))).boxed(),
    }
}

/// Returns the slot to `Idle` when a build exits before the wait, including
/// when the caller drops the build future.
struct Reservation<'a> {
    orchestrator: &'a Orchestrator,
    ticket: u64,
    armed: bool,
}

impl Reservation<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.orchestrator.slot();
        if slot.owns(self.ticket) {
            slot.owner = None;
            slot.session = None;
            slot.state = BuildState::Idle;
        }
    }
}

/// The requester application: a host connection, the orchestrator, and the
/// server the host pulls geometry from.
#[derive(Debug)]
pub struct App {
    host: HostClient,
    orchestrator: Orchestrator,
    server: ServerHandle,
    endpoint: String,
}

impl App {
    /// Start the streaming server and connect to the host.
    pub async fn start(config: &Config) -> Result<Self> {
        let orchestrator = Orchestrator::new(config.heartbeat);
        let server = Server::new(orchestrator.methods()?)
            .bind(config.requester_addr())
            .await?
            .spawn();
        let endpoint = format!("{}:{}", config.host, server.local_addr().port());

        let host = match HostClient::connect(config.app_addr()).await {
            Ok(host) => host,
            Err(e) => {
                server.stop().await?;
                return Err(e);
            }
        };

        Ok(Self {
            host,
            orchestrator,
            server,
            endpoint,
        })
    }

    /// Build `geometry` on the host. See [`Orchestrator::build`].
    pub async fn build(&self, geometry: Geometry, options: BuildOptions) -> Result<String> {
        self.orchestrator
            .build(&self.host, &self.endpoint, geometry, options)
            .await
    }

    /// The host connection.
    pub fn host(&self) -> &HostClient {
        &self.host
    }

    /// The build orchestrator.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Where the host reaches this process.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Close the host connection and stop the streaming server.
    pub async fn stop(mut self) -> Result<()> {
        self.host.close();
        self.server.stop().await
    }
}
