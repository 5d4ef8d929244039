// Paw Agent Engine — Tool Registry & Dispatcher
//
// One namespace for every callable tool: local functions (scripts and
// native Rust) and remote tools from MCP connections, built-in connectors
// included. The registry is an explicit object owned by the host; nothing
// here is global.
//
// `dispatch` is the single entry point for callers. It never returns an
// error or panics past its boundary: every outcome, including unknown
// names and bad arguments, is a `ToolInvocationResult`.

pub mod batch;
pub mod validate;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::*;
use crate::engine::mcp::McpConnection;
use crate::engine::sandbox::{Executable, ScriptFunction, ScriptSandbox};
use futures::FutureExt;
use log::{info, warn};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use validate::validate_arguments;

/// What a registered name routes to.
#[derive(Clone)]
pub enum ToolHandle {
    Local(Arc<dyn Executable>),
    Remote {
        connection: Arc<McpConnection>,
        /// Server-side (unprefixed) tool name.
        tool: String,
    },
}

impl ToolHandle {
    fn matches(&self, origin: &ToolOrigin) -> bool {
        match (self, origin) {
            (ToolHandle::Local(_), ToolOrigin::Local) => true,
            (ToolHandle::Remote { connection, .. }, ToolOrigin::Remote(server)) => connection.name() == server,
            _ => false,
        }
    }
}

struct Entry {
    descriptor: ToolDescriptor,
    handle: ToolHandle,
    /// Script group (file) a local function was loaded from.
    group: Option<String>,
}

#[derive(Default)]
struct Inner {
    tools: HashMap<String, Entry>,
    /// Names in registration order.
    order: Vec<String>,
    /// Remote servers in the order their first tool was registered.
    servers: Vec<String>,
}

impl Inner {
    fn insert(&mut self, entry: Entry) {
        let name = entry.descriptor.name.clone();
        if let Some(server) = entry.descriptor.origin.server() {
            if !self.servers.iter().any(|s| s == server) {
                self.servers.push(server.to_string());
            }
        }
        if self.tools.insert(name.clone(), entry).is_some() {
            self.order.retain(|n| *n != name);
            // An override may have taken a server's last tool.
            self.prune_servers();
        }
        self.order.push(name);
    }

    fn prune_servers(&mut self) {
        let live: HashSet<&str> = self
            .tools
            .values()
            .filter_map(|e| e.descriptor.origin.server())
            .collect();
        self.servers.retain(|s| live.contains(s.as_str()));
    }

    fn remove_where(&mut self, pred: impl Fn(&Entry) -> bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .order
            .iter()
            .filter(|n| self.tools.get(*n).map(&pred).unwrap_or(false))
            .cloned()
            .collect();
        for name in &doomed {
            self.tools.remove(name);
        }
        self.order.retain(|n| self.tools.contains_key(n));
        self.prune_servers();
        doomed
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ───────────────────────────────────────────────────

    /// Register one tool. Without `allow_override` an existing name is a
    /// `NameConflict` and the existing registration stays untouched.
    pub fn register(&self, descriptor: ToolDescriptor, handle: ToolHandle, allow_override: bool) -> EngineResult<()> {
        check_descriptor(&descriptor, &handle)?;
        let mut inner = self.inner.write();
        if !allow_override && inner.tools.contains_key(&descriptor.name) {
            return Err(EngineError::NameConflict(descriptor.name));
        }
        info!("[tools] Registered {} ({})", descriptor.name, descriptor.origin);
        inner.insert(Entry { descriptor, handle, group: None });
        Ok(())
    }

    /// Register every callable of one script file, or none of them.
    pub fn register_script_group(
        &self,
        group_id: &str,
        definitions: Vec<FunctionDefinition>,
        sandbox: &ScriptSandbox,
        allow_override: bool,
    ) -> EngineResult<Vec<String>> {
        let default_timeout = sandbox.config().default_timeout_ms;
        let mut inner = self.inner.write();

        let mut seen = HashSet::new();
        for def in &definitions {
            if !seen.insert(def.name.as_str()) {
                return Err(EngineError::validation(group_id, format!("'{}' is declared twice", def.name)));
            }
            // Replacing a function from the same group is a reload, not a conflict.
            let taken = inner
                .tools
                .get(&def.name)
                .map(|e| e.group.as_deref() != Some(group_id))
                .unwrap_or(false);
            if taken && !allow_override {
                return Err(EngineError::NameConflict(def.name.clone()));
            }
        }

        // A reload drops functions the new version no longer declares.
        inner.remove_where(|e| e.group.as_deref() == Some(group_id));

        let mut names = Vec::with_capacity(definitions.len());
        for def in definitions {
            let descriptor = ToolDescriptor::local(&def.parsed_schema, default_timeout);
            names.push(descriptor.name.clone());
            let handle = ToolHandle::Local(Arc::new(ScriptFunction::new(def, sandbox.clone())));
            inner.insert(Entry { descriptor, handle, group: Some(group_id.to_string()) });
        }
        info!("[tools] Loaded {} function(s) from {}", names.len(), group_id);
        Ok(names)
    }

    /// Parse a script and register its callables as one group.
    pub fn register_script(
        &self,
        source: &str,
        group_id: &str,
        sandbox: &ScriptSandbox,
        allow_override: bool,
    ) -> EngineResult<Vec<String>> {
        let definitions = crate::engine::functions::load_script(source, group_id)?;
        self.register_script_group(group_id, definitions, sandbox, allow_override)
    }

    /// Register (or re-register) every cached tool of a connection.
    /// Earlier registrations for the same server are replaced.
    pub fn register_server(&self, connection: &Arc<McpConnection>, allow_override: bool) -> EngineResult<usize> {
        let server = connection.name().to_string();
        let descriptors = connection.descriptors();
        let mut inner = self.inner.write();

        if !allow_override {
            for d in &descriptors {
                if let Some(existing) = inner.tools.get(&d.name) {
                    if existing.descriptor.origin.server() != Some(server.as_str()) {
                        return Err(EngineError::NameConflict(d.name.clone()));
                    }
                }
            }
        }

        let position = inner.servers.iter().position(|s| *s == server);
        inner.remove_where(|e| e.descriptor.origin.server() == Some(server.as_str()));
        // Keep the server's place in the listing across refreshes.
        if let Some(i) = position.filter(|_| !descriptors.is_empty()) {
            let i = i.min(inner.servers.len());
            inner.servers.insert(i, server.clone());
        }

        let count = descriptors.len();
        for descriptor in descriptors {
            let tool = descriptor
                .name
                .strip_prefix(&format!("{}_", server))
                .unwrap_or(&descriptor.name)
                .to_string();
            let handle = ToolHandle::Remote { connection: Arc::clone(connection), tool };
            inner.insert(Entry { descriptor, handle, group: None });
        }
        info!("[tools] Registered {} tool(s) from server '{}'", count, server);
        Ok(count)
    }

    pub fn remove(&self, name: &str) -> bool {
        !self.inner.write().remove_where(|e| e.descriptor.name == name).is_empty()
    }

    /// Remove every function loaded from one script group.
    pub fn remove_group(&self, group_id: &str) -> usize {
        let removed = self.inner.write().remove_where(|e| e.group.as_deref() == Some(group_id));
        if !removed.is_empty() {
            info!("[tools] Removed group {} ({} tools)", group_id, removed.len());
        }
        removed.len()
    }

    /// Remove every tool of one remote server.
    pub fn remove_server(&self, server: &str) -> usize {
        let removed = self
            .inner
            .write()
            .remove_where(|e| e.descriptor.origin.server() == Some(server));
        if !removed.is_empty() {
            info!("[tools] Removed server '{}' ({} tools)", server, removed.len());
        }
        removed.len()
    }

    // ── Lookup ─────────────────────────────────────────────────────────

    /// Local tools in registration order, then remote tools grouped by
    /// server in connection order.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let inner = self.inner.read();
        let mut out: Vec<ToolDescriptor> = inner
            .order
            .iter()
            .filter_map(|n| inner.tools.get(n))
            .filter(|e| e.descriptor.is_local())
            .map(|e| e.descriptor.clone())
            .collect();
        for server in &inner.servers {
            out.extend(
                inner
                    .order
                    .iter()
                    .filter_map(|n| inner.tools.get(n))
                    .filter(|e| e.descriptor.origin.server() == Some(server.as_str()))
                    .map(|e| e.descriptor.clone()),
            );
        }
        out
    }

    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.inner.read().tools.get(name).map(|e| e.descriptor.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Dispatch ───────────────────────────────────────────────────────

    /// Validate and run one call, bounded by `deadline` and by the
    /// tool's own `timeout_ms`, whichever comes first.
    pub async fn dispatch(&self, name: &str, args: &Value, deadline: Instant) -> ToolInvocationResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        let resolved = {
            let inner = self.inner.read();
            inner
                .tools
                .get(name)
                .map(|e| (e.descriptor.clone(), e.handle.clone()))
        };
        let Some((descriptor, handle)) = resolved else {
            warn!("[tools] Unknown tool: {}", name);
            return ToolInvocationResult::failure(
                ErrorKind::UnknownTool,
                EngineError::UnknownTool(name.to_string()).to_string(),
                None,
                elapsed(),
            );
        };
        let origin = descriptor.origin.clone();

        info!("[tools] Dispatching {} ({}) args={}", name, origin, preview(args));

        if let Err(e) = validate_arguments(name, &descriptor.parameter_schema, args) {
            warn!("[tools] {} rejected: {}", name, e);
            return ToolInvocationResult::failure(e.kind(), e.to_string(), Some(origin), elapsed());
        }

        let budget = started + Duration::from_millis(descriptor.timeout_ms);
        let effective = deadline.min(budget);
        if effective <= Instant::now() {
            let e = EngineError::timeout(name, 0);
            return ToolInvocationResult::failure(e.kind(), e.to_string(), Some(origin), elapsed());
        }

        let run = async {
            match &handle {
                ToolHandle::Local(exec) => exec.invoke(args, effective).await,
                ToolHandle::Remote { connection, tool } => connection.call_tool(tool, args, effective).await,
            }
        };
        let outcome = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::execution(name, "tool panicked")),
        };

        let duration_ms = elapsed();
        match outcome {
            Ok(value) => {
                info!("[tools] {} ok in {}ms", name, duration_ms);
                ToolInvocationResult::ok(value, origin, duration_ms)
            }
            Err(e) => {
                warn!("[tools] {} failed in {}ms: {}", name, duration_ms, e);
                ToolInvocationResult::failure(e.kind(), e.to_string(), Some(origin), duration_ms)
            }
        }
    }
}

fn check_descriptor(descriptor: &ToolDescriptor, handle: &ToolHandle) -> EngineResult<()> {
    if descriptor.name.trim().is_empty() {
        return Err(EngineError::validation("register", "tool name must not be empty"));
    }
    if !handle.matches(&descriptor.origin) {
        return Err(EngineError::validation(
            descriptor.name.as_str(),
            format!("handle does not match origin {}", descriptor.origin),
        ));
    }
    Ok(())
}

fn preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() <= 200 {
        return s;
    }
    let mut end = 200;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ── Tests ──────────────────────────────────────────────────────────────
