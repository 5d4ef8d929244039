// Paw Agent Engine — Script Sandboxing
// Runs local tool functions inside a fresh V8 isolate per call.
// Uses deno_core with no extensions: no filesystem, process, or network ops.
//
// Isolation model:
//   • One JsRuntime per invocation, on its own OS thread, dropped afterwards.
//   • The deadline is enforced from the async side: when it elapses the
//     isolate is terminated through its thread-safe handle and never reused.
//   • The V8 heap is capped; a script that reaches the cap is terminated
//     and reported as an execution error instead of aborting the process.
//   • `console.*` is the only output channel; it is captured per call and
//     forwarded to the log under `[sandbox:<function>]`.

use crate::atoms::constants::{
    DEFAULT_TOOL_TIMEOUT_MS, SANDBOX_MAX_HEAP_MB, SANDBOX_MAX_LOG_LINES, SANDBOX_MAX_LOG_LINE_CHARS,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CallStyle, FunctionDefinition, FunctionSchema};
use crate::engine::tools::validate::type_name;
use async_trait::async_trait;
use deno_core::{serde_v8, v8, JsRuntime, ModuleCodeString, RuntimeOptions};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

// ── Types ──────────────────────────────────────────────────────────────

/// Sandbox configuration for local tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Budget for a call when the function has no `@timeout` (default: 5000)
    pub default_timeout_ms: u64,
    /// Captured `console.*` lines kept per call (default: 200)
    pub max_log_lines: usize,
    /// V8 heap ceiling per call in MiB (default: 64)
    pub max_heap_mb: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            max_log_lines: SANDBOX_MAX_LOG_LINES,
            max_heap_mb: SANDBOX_MAX_HEAP_MB,
        }
    }
}

/// One captured `console.*` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptLogLine {
    pub level: String,
    pub message: String,
}

/// Result of a successful script run.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub value: Value,
    pub logs: Vec<ScriptLogLine>,
}

/// Anything the registry can invoke locally.
#[async_trait]
pub trait Executable: Send + Sync {
    /// Run with caller-supplied JSON arguments; must not outlive `deadline`.
    async fn invoke(&self, args: &Value, deadline: Instant) -> EngineResult<Value>;

    /// Short label for logs ("script" / "native").
    fn kind(&self) -> &'static str;
}

// ── Native functions ───────────────────────────────────────────────────

type NativeFn = dyn Fn(&Value) -> EngineResult<Value> + Send + Sync;

/// A Rust closure exposed as a local tool.
///
/// Runs on the blocking pool. Rust code cannot be pre-empted, so on
/// timeout the call is abandoned and its eventual result discarded.
#[derive(Clone)]
pub struct NativeFunction {
    name: String,
    func: Arc<NativeFn>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&Value) -> EngineResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl Executable for NativeFunction {
    async fn invoke(&self, args: &Value, deadline: Instant) -> EngineResult<Value> {
        let started = Instant::now();
        let func = Arc::clone(&self.func);
        let args = args.clone();
        let task = tokio::task::spawn_blocking(move || func(&args));

        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::execution(
                self.name.as_str(),
                format!("native function failed: {}", join_err),
            )),
            Err(_) => {
                warn!("[sandbox] Native function '{}' abandoned at deadline", self.name);
                Err(EngineError::timeout(
                    self.name.as_str(),
                    started.elapsed().as_millis() as u64,
                ))
            }
        }
    }

    fn kind(&self) -> &'static str {
        "native"
    }
}

// ── Script functions ───────────────────────────────────────────────────

/// A loaded script function bound to the sandbox that runs it.
pub struct ScriptFunction {
    definition: Arc<FunctionDefinition>,
    sandbox: ScriptSandbox,
}

impl ScriptFunction {
    pub fn new(definition: FunctionDefinition, sandbox: ScriptSandbox) -> Self {
        Self {
            definition: Arc::new(definition),
            sandbox,
        }
    }

    pub fn definition(&self) -> &FunctionDefinition {
        &self.definition
    }
}

#[async_trait]
impl Executable for ScriptFunction {
    async fn invoke(&self, args: &Value, deadline: Instant) -> EngineResult<Value> {
        self.sandbox
            .execute(&self.definition, args, deadline)
            .await
            .map(|out| out.value)
    }

    fn kind(&self) -> &'static str {
        "script"
    }
}

// ── Sandbox engine ─────────────────────────────────────────────────────

/// Executes script functions. Holds configuration only; no interpreter
/// state lives here, so one instance can serve concurrent calls.
#[derive(Debug, Clone, Default)]
pub struct ScriptSandbox {
    config: SandboxConfig,
}

impl ScriptSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `definition` with `args` in a fresh isolate, bounded by `deadline`.
    pub async fn execute(
        &self,
        definition: &FunctionDefinition,
        args: &Value,
        deadline: Instant,
    ) -> EngineResult<ExecutionOutput> {
        let name = definition.name.clone();
        let call_args = build_call_args(&definition.parsed_schema, args)?;
        let program = build_program(
            &definition.source_text,
            &name,
            &call_args,
            self.config.max_log_lines,
        );

        let started = Instant::now();
        let slot = Arc::new(IsolateSlot::default());
        let (tx, rx) = oneshot::channel();

        let thread_slot = Arc::clone(&slot);
        let thread_name = name.clone();
        let heap_mb = self.config.max_heap_mb;
        std::thread::Builder::new()
            .name(format!("paw-sandbox-{}", name))
            .spawn(move || {
                let outcome = run_isolated(&thread_name, program, heap_mb, &thread_slot);
                let _ = tx.send(outcome);
            })
            .map_err(|e| {
                EngineError::execution(name.as_str(), format!("failed to start sandbox: {}", e))
            })?;

        let mut guard = AbandonGuard { slot: Arc::clone(&slot), armed: true };
        let waited = tokio::time::timeout_at(deadline, rx).await;
        if waited.is_ok() {
            guard.armed = false;
        }
        match waited {
            Ok(Ok(outcome)) => {
                let output = outcome?;
                debug!(
                    "[sandbox] {} finished in {}ms ({} log lines)",
                    name,
                    started.elapsed().as_millis(),
                    output.logs.len()
                );
                Ok(output)
            }
            Ok(Err(_)) => Err(EngineError::execution(
                name.as_str(),
                "sandbox exited without a result",
            )),
            Err(_) => {
                slot.terminate();
                let elapsed = started.elapsed().as_millis() as u64;
                warn!("[sandbox] {} timed out after {}ms, isolate terminated", name, elapsed);
                Err(EngineError::timeout(name.as_str(), elapsed))
            }
        }
    }
}

/// Hand-off point for the isolate's termination handle between the
/// sandbox thread and the awaiting caller.
#[derive(Default)]
struct IsolateSlot {
    inner: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    handle: Option<v8::IsolateHandle>,
    cancelled: bool,
}

impl IsolateSlot {
    /// Returns `false` if the caller already gave up.
    fn attach(&self, handle: v8::IsolateHandle) -> bool {
        let mut state = self.inner.lock();
        if state.cancelled {
            return false;
        }
        state.handle = Some(handle);
        true
    }

    fn terminate(&self) {
        let mut state = self.inner.lock();
        state.cancelled = true;
        if let Some(handle) = state.handle.take() {
            handle.terminate_execution();
        }
    }
}

/// Terminates the isolate if the awaiting caller goes away first.
struct AbandonGuard {
    slot: Arc<IsolateSlot>,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.armed {
            self.slot.terminate();
        }
    }
}

/// Body of the sandbox thread.
fn run_isolated(
    fn_name: &str,
    program: String,
    heap_mb: usize,
    slot: &IsolateSlot,
) -> EngineResult<ExecutionOutput> {
    let mut runtime = JsRuntime::new(RuntimeOptions {
        create_params: Some(v8::CreateParams::default().heap_limits(0, heap_mb * 1024 * 1024)),
        ..Default::default()
    });
    let handle = runtime.v8_isolate().thread_safe_handle();
    if !slot.attach(handle.clone()) {
        return Err(EngineError::timeout(fn_name, 0));
    }

    // Terminate on the first near-limit signal and grant headroom so V8
    // can unwind instead of aborting.
    let heap_exhausted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&heap_exhausted);
    runtime.add_near_heap_limit_callback(move |current, _initial| {
        flag.store(true, Ordering::SeqCst);
        handle.terminate_execution();
        current * 2
    });

    let executed = runtime.execute_script("paw:sandbox", ModuleCodeString::from(program));
    let global = match executed {
        Ok(global) => global,
        Err(_) if heap_exhausted.load(Ordering::SeqCst) => {
            warn!("[sandbox] {} hit the {} MiB heap limit, isolate terminated", fn_name, heap_mb);
            return Err(EngineError::execution(
                fn_name,
                format!("script exceeded the {} MiB heap limit", heap_mb),
            ));
        }
        Err(e) => return Err(EngineError::execution(fn_name, first_line(&e.to_string()))),
    };

    let envelope: String = {
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, global);
        serde_v8::from_v8(scope, local).map_err(|e| {
            EngineError::execution(fn_name, format!("sandbox produced no envelope: {}", e))
        })?
    };

    parse_envelope(fn_name, &envelope)
}

// ── Program assembly ───────────────────────────────────────────────────

/// Render caller arguments as a JS array literal in call order.
/// JSON is valid JS, so values are embedded verbatim; absent optional
/// parameters become `undefined` so JS default values apply.
fn build_call_args(schema: &FunctionSchema, args: &Value) -> EngineResult<String> {
    let empty = serde_json::Map::new();
    let obj = match args {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => {
            return Err(EngineError::validation(
                schema.name.as_str(),
                format!("arguments must be a JSON object, got {}", type_name(other)),
            ))
        }
    };

    match schema.call_style {
        CallStyle::ObjectArg => Ok(format!("[{}]", serde_json::to_string(obj)?)),
        CallStyle::Positional => {
            let mut parts = Vec::with_capacity(schema.parameters.len());
            for param in &schema.parameters {
                match obj.get(&param.name) {
                    Some(v) => parts.push(serde_json::to_string(v)?),
                    None => parts.push("undefined".to_string()),
                }
            }
            Ok(format!("[{}]", parts.join(", ")))
        }
    }
}

const PRELUDE: &str = r#"(function () {
  const __pawStringify = JSON.stringify.bind(JSON);
  const __pawLogs = [];
  const __pawFormat = (v) => {
    if (typeof v === "string") return v;
    try {
      const s = __pawStringify(v);
      return s === undefined ? String(v) : s;
    } catch (_) {
      return String(v);
    }
  };
  const __pawSink = (level) => (...args) => {
    if (__pawLogs.length < __PAW_MAX_LOGS__) {
      __pawLogs.push({ level, message: args.map(__pawFormat).join(" ") });
    }
  };
  const __pawConsole = Object.freeze({
    log: __pawSink("info"),
    info: __pawSink("info"),
    debug: __pawSink("debug"),
    warn: __pawSink("warn"),
    error: __pawSink("error"),
  });
  try {
    Object.defineProperty(globalThis, "console", { value: __pawConsole, writable: false, configurable: true });
  } catch (_) {
    globalThis.console = __pawConsole;
  }
  for (const name of ["Deno", "__bootstrap", "WebAssembly", "SharedArrayBuffer", "Atomics"]) {
    try {
      if (!(delete globalThis[name])) globalThis[name] = undefined;
    } catch (_) {}
  }
  const __pawDone = (status, extra) =>
    __pawStringify(Object.assign({ status, logs: __pawLogs }, extra));
  let __pawValue;
  try {
    __pawValue = (function () {
"#;

const EPILOGUE: &str = r#"
    })();
  } catch (e) {
    const message = e instanceof Error ? `${e.name}: ${e.message}` : String(e);
    return __pawDone("thrown", { message });
  }
  if (__pawValue !== null && typeof __pawValue === "object" && typeof __pawValue.then === "function") {
    return __pawDone("unserializable", { message: "async results are not supported" });
  }
  let serialized;
  try {
    serialized = __pawValue === undefined ? "null" : __pawStringify(__pawValue);
  } catch (e) {
    return __pawDone("unserializable", { message: String(e && e.message ? e.message : e) });
  }
  if (serialized === undefined) {
    return __pawDone("unserializable", { message: `a ${typeof __pawValue} has no JSON form` });
  }
  return `{"status":"ok","logs":${__pawStringify(__pawLogs)},"value":${serialized}}`;
})()
"#;

fn build_program(source: &str, fn_name: &str, call_args: &str, max_logs: usize) -> String {
    let mut program = String::with_capacity(PRELUDE.len() + source.len() + EPILOGUE.len() + 128);
    program.push_str(&PRELUDE.replace("__PAW_MAX_LOGS__", &max_logs.to_string()));
    program.push_str(source);
    program.push_str("\n;\n      return ");
    program.push_str(fn_name);
    program.push_str("(...");
    program.push_str(call_args);
    program.push_str(");");
    program.push_str(EPILOGUE);
    program
}

// ── Envelope decoding ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    logs: Vec<ScriptLogLine>,
    #[serde(default)]
    value: Value,
}

fn parse_envelope(fn_name: &str, raw: &str) -> EngineResult<ExecutionOutput> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    forward_logs(fn_name, &envelope.logs);

    match envelope.status.as_str() {
        "ok" => Ok(ExecutionOutput {
            value: envelope.value,
            logs: envelope.logs,
        }),
        "unserializable" => Err(EngineError::execution(
            fn_name,
            format!(
                "result is not JSON-serializable: {}",
                envelope.message.unwrap_or_default()
            ),
        )),
        _ => Err(EngineError::execution(
            fn_name,
            envelope.message.unwrap_or_else(|| "script failed".into()),
        )),
    }
}

fn forward_logs(fn_name: &str, logs: &[ScriptLogLine]) {
    for line in logs {
        let msg: String = line.message.chars().take(SANDBOX_MAX_LOG_LINE_CHARS).collect();
        match line.level.as_str() {
            "error" | "warn" => warn!("[sandbox:{}] {}", fn_name, msg),
            "debug" => debug!("[sandbox:{}] {}", fn_name, msg),
            _ => info!("[sandbox:{}] {}", fn_name, msg),
        }
    }
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or(s).trim().to_string()
}

// ── Tests ──────────────────────────────────────────────────────────────
