//! Plugin discovery and loading.
//!
//! A plugin is a JSON manifest declaring commands. Manifests are found on a
//! search path whose entries are manifest files, directories searched
//! recursively for `*.json`, or dotted locators naming plugins compiled into
//! this crate (`hyview.mesh`). Loading a plugin registers its commands on a
//! [`Registry`]; loading the same source twice is a no-op.
//!
//! ```json
//! {
//!   "commands": {
//!     "mesh_all": {"kind": "scene", "operation": "particlefluidsurface",
//!                  "defaults": {"particlesep": 8}},
//!     "stats": {"kind": "exec", "program": "/usr/local/bin/stats", "args": ["--json"]}
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt;

use crate::config::expand_home;
use crate::error::{Error, Result};
use crate::registry::{Handler, Methods, Registry, parse_args};
use crate::scene::{NodeInspector, SceneBuilder};

/// Locator of the built-in meshing plugin.
pub const MESH_PLUGIN: &str = "hyview.mesh";

/// Host collaborators plugin commands act on.
#[derive(Clone)]
pub struct PluginContext {
    /// Applies operations to nodes.
    pub builder: Arc<dyn SceneBuilder>,
    /// Enumerates nodes.
    pub inspector: Arc<dyn NodeInspector>,
}

impl PluginContext {
    /// Context over separate collaborators.
    pub fn new(builder: Arc<dyn SceneBuilder>, inspector: Arc<dyn NodeInspector>) -> Self {
        Self { builder, inspector }
    }

    /// Context over a scene implementing both collaborators.
    pub fn from_scene<S>(scene: Arc<S>) -> Self
    where
        S: SceneBuilder + NodeInspector + 'static,
    {
        Self {
            builder: scene.clone(),
            inspector: scene,
        }
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext").finish_non_exhaustive()
    }
}

/// A plugin manifest.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Manifest {
    /// Commands by method name.
    pub commands: BTreeMap<String, Command>,
}

/// A command declared by a manifest.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Command {
    /// Apply a scene operation to every node not already carrying it.
    ///
    /// Call arguments are merged over `defaults`.
    Scene {
        /// Operation name passed to [`SceneBuilder::apply`].
        operation: String,
        /// Default parameters.
        #[serde(default)]
        defaults: Map<String, Value>,
    },
    /// Run an external program with the call arguments as JSON on stdin.
    ///
    /// Stdout is parsed as JSON, falling back to a string. A non-zero exit
    /// status fails the call.
    Exec {
        /// Program to run.
        program: PathBuf,
        /// Fixed arguments.
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Command {
    fn into_handler(self, name: &str, ctx: &PluginContext) -> Handler {
        match self {
            Command::Scene {
                operation,
                defaults,
            } => scene_command(name, operation, defaults, ctx),
            Command::Exec { program, args } => exec_command(name, program, args),
        }
    }
}

/// Split a search path on `:` and `;`, dropping empty entries.
pub fn split_search_path(search_path: &str) -> Vec<String> {
    search_path
        .split([':', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Manifest of a compiled-in plugin.
pub fn builtin(locator: &str) -> Option<Manifest> {
    match locator {
        MESH_PLUGIN => {
            let defaults = Map::from_iter([
                ("particlesep".to_string(), json!(8)),
                ("transferattribs".to_string(), json!("Cd")),
            ]);
            let commands = BTreeMap::from([(
                "mesh_all".to_string(),
                Command::Scene {
                    operation: "particlefluidsurface".to_string(),
                    defaults,
                },
            )]);
            Some(Manifest { commands })
        }
        _ => None,
    }
}

enum Source {
    File(PathBuf),
    Builtin(String),
}

impl Source {
    fn key(&self) -> String {
        match self {
            Source::File(path) => path.display().to_string(),
            Source::Builtin(locator) => locator.clone(),
        }
    }

    fn manifest(&self) -> Result<Manifest> {
        match self {
            Source::File(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)
                    .map_err(|e| Error::Plugin(format!("{}: {e}", path.display())))
            }
            Source::Builtin(locator) => {
                builtin(locator).ok_or_else(|| Error::Plugin(format!("unknown plugin {locator}")))
            }
        }
    }
}

fn resolve(entry: &str) -> Result<Vec<Source>> {
    let path = expand_home(Path::new(entry));
    if path.is_dir() {
        let root = glob::Pattern::escape(&path.display().to_string());
        let pattern = format!("{root}/**/*.json");
        let walk = glob::glob(&pattern).map_err(|e| Error::Plugin(format!("{entry}: {e}")))?;
        let mut files = Vec::new();
        for file in walk {
            let file = file.map_err(|e| Error::Plugin(e.to_string()))?;
            if file.is_file() {
                files.push(Source::File(file.canonicalize()?));
            }
        }
        return Ok(files);
    }
    if path.is_file() {
        if path.extension().is_some_and(|ext| ext == "json") {
            return Ok(vec![Source::File(path.canonicalize()?)]);
        }
        return Err(Error::Plugin(format!("{entry} is not a .json manifest")));
    }
    if builtin(entry).is_some() {
        return Ok(vec![Source::Builtin(entry.to_string())]);
    }
    Err(Error::Plugin(format!("cannot locate plugin {entry:?}")))
}

impl Registry {
    /// Load every plugin found on the given search path entries.
    ///
    /// Each entry may itself be a `:`/`;` separated list. Sources already
    /// loaded by this registry are skipped. Returns how many sources were
    /// newly loaded.
    pub fn load_paths<I>(&mut self, entries: I, ctx: &PluginContext) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut loaded = 0;
        for entry in entries {
            for entry in split_search_path(entry.as_ref()) {
                for source in resolve(&entry)? {
                    let key = source.key();
                    if self.is_loaded(&key) {
                        tracing::debug!(source = %key, "plugin already loaded");
                        continue;
                    }
                    let mut methods = Methods::new();
                    for (name, command) in source.manifest()?.commands {
                        let handler = command.into_handler(&name, ctx);
                        methods.insert(name, handler)?;
                    }
                    self.register_all(&methods)?;
                    tracing::info!(source = %key, methods = ?methods.names(), "loaded plugin");
                    self.mark_loaded(key);
                    loaded += 1;
                }
            }
        }
        Ok(loaded)
    }
}

fn scene_command(
    name: &str,
    operation: String,
    defaults: Map<String, Value>,
    ctx: &PluginContext,
) -> Handler {
    let name: Arc<str> = name.into();
    let operation: Arc<str> = operation.into();
    let defaults = Arc::new(defaults);
    let ctx = ctx.clone();
    Handler::unary(move |args| {
        let name = name.clone();
        let operation = operation.clone();
        let defaults = defaults.clone();
        let ctx = ctx.clone();
        async move {
            let overrides: Map<String, Value> = parse_args(&name, args)?;
            let mut params = (*defaults).clone();
            params.extend(overrides);
            let params = Value::Object(params);

            let mut applied = Vec::new();
            for node in ctx.inspector.nodes().await {
                if ctx.inspector.last_operation(&node).await.as_deref() == Some(&*operation) {
                    tracing::debug!(node = %node, operation = %operation, "already applied");
                    continue;
                }
                ctx.builder.apply(&node, &operation, params.clone()).await?;
                applied.push(node);
            }
            Ok(json!({ "applied": applied }))
        }
    })
}

fn exec_command(name: &str, program: PathBuf, args: Vec<String>) -> Handler {
    let name: Arc<str> = name.into();
    let program = Arc::new(program);
    let args = Arc::new(args);
    Handler::unary(move |input| {
        let name = name.clone();
        let program = program.clone();
        let args = args.clone();
        async move {
            let mut child = tokio::process::Command::new(program.as_path())
                .args(args.iter())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| Error::Plugin(format!("{name}: cannot run {}: {e}", program.display())))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&serde_json::to_vec(&input)?).await?;
            }

            let output = child.wait_with_output().await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::Plugin(format!(
                    "{name} failed ({}): {}",
                    output.status,
                    stderr.trim()
                )));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stdout = stdout.trim();
            if stdout.is_empty() {
                return Ok(Value::Null);
            }
            Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
        }
    })
}
