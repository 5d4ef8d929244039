// paw-tools — operator CLI for the Paw tool runtime.
//
// stdout carries JSON results (and the MCP wire in `serve` mode); all
// logging goes to stderr.

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{info, warn};
use paw_tool_runtime::engine::connectors::{self, BUILTIN_CONNECTORS};
use paw_tool_runtime::engine::mcp::server::ConnectorServer;
use paw_tool_runtime::{EngineError, EngineResult, RuntimeConfig, ToolInvocationResult, ToolRuntime};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "paw-tools", version, about = "Inspect, call and serve Paw tools")]
struct Cli {
    /// Config file (default: <config dir>/paw/tools.toml)
    #[arg(long, global = true, env = "PAW_TOOLS_CONFIG")]
    config: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Built-in connectors and MCP servers
    #[command(subcommand)]
    Mcp(McpCommand),
    /// Print a shell completion script
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum McpCommand {
    /// List connectors and configured servers
    List,
    /// Show a connector's tool descriptors
    Tools { connector: String },
    /// Invoke one tool and print the result envelope
    Call(CallArgs),
    /// Expose a connector over MCP on stdin/stdout
    Serve { connector: String },
}

#[derive(Args)]
#[command(disable_help_flag = true)]
struct CallArgs {
    /// Registry name, e.g. `factorial` or `github_list_repos`
    tool: Option<String>,

    /// Arguments as a JSON object
    #[arg(long, default_value = "{}")]
    args: String,

    /// Caller deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Describe the tool instead of calling it
    #[arg(short, long)]
    help: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectorRow {
    name: String,
    kind: &'static str,
    tool_count: Option<usize>,
    configured: bool,
    enabled: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Stderr)
        .init();
}

async fn run(cli: Cli) -> EngineResult<i32> {
    let command = match cli.command {
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "paw-tools", &mut std::io::stdout());
            return Ok(0);
        }
        Command::Mcp(command) => command,
    };

    let config = load_config(cli.config.as_deref())?;
    match command {
        McpCommand::List => {
            print_json(&json!(list_rows(&config)))?;
            Ok(0)
        }
        McpCommand::Tools { connector } => {
            let api = connectors::service_api(&connector)
                .ok_or_else(|| EngineError::Config(format!("unknown connector '{}'", connector)))?;
            print_json(&json!(connectors::descriptors(api.as_ref())))?;
            Ok(0)
        }
        McpCommand::Call(args) => call(config, args).await,
        McpCommand::Serve { connector } => {
            let runtime = ToolRuntime::new(config)?;
            let connector = Arc::new(runtime.build_connector(&connector)?);
            info!("[mcp] Serving '{}' on stdio", connector.service_name());
            ConnectorServer::new(connector)
                .serve(tokio::io::stdin(), tokio::io::stdout())
                .await?;
            Ok(0)
        }
    }
}

// ── Config ─────────────────────────────────────────────────────────────

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("paw").join("tools.toml"))
}

fn load_config(explicit: Option<&Path>) -> EngineResult<RuntimeConfig> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(RuntimeConfig::default()),
        },
    };
    let content = std::fs::read_to_string(&path)
        .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    info!("[config] Loaded {}", path.display());
    RuntimeConfig::from_toml_str(&content)
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn load_user_scripts(runtime: &ToolRuntime) {
    for entry in runtime.config().scripts.clone() {
        let path = expand_home(&entry);
        let loaded = std::fs::read_to_string(&path)
            .map_err(EngineError::from)
            .and_then(|source| runtime.load_script(&source, &format!("file:{}", path.display())));
        match loaded {
            Ok(names) => info!("[functions] {} -> {}", path.display(), names.join(", ")),
            Err(e) => warn!("[functions] Skipping {}: {}", path.display(), e),
        }
    }
}

// ── Commands ───────────────────────────────────────────────────────────

fn list_rows(config: &RuntimeConfig) -> Vec<ConnectorRow> {
    let mut rows: Vec<ConnectorRow> = BUILTIN_CONNECTORS
        .iter()
        .map(|name| {
            let settings = config.connectors.get(*name);
            ConnectorRow {
                name: name.to_string(),
                kind: "connector",
                tool_count: connectors::service_api(name).map(|api| connectors::descriptors(api.as_ref()).len()),
                configured: settings.is_some(),
                enabled: settings.map(|s| s.enabled).unwrap_or(false),
            }
        })
        .collect();
    rows.extend(config.mcp.servers.iter().map(|s| ConnectorRow {
        name: s.name.clone(),
        kind: "server",
        tool_count: None,
        configured: true,
        enabled: s.enabled,
    }));
    rows
}

async fn call(config: RuntimeConfig, args: CallArgs) -> EngineResult<i32> {
    let Some(tool) = args.tool else {
        let mut cmd = Cli::command();
        if let Some(call) = cmd
            .find_subcommand_mut("mcp")
            .and_then(|mcp| mcp.find_subcommand_mut("call"))
        {
            call.print_help()?;
        }
        return Ok(if args.help { 0 } else { 2 });
    };
    let arguments: Value = serde_json::from_str(&args.args)
        .map_err(|e| EngineError::Config(format!("--args is not valid JSON: {}", e)))?;

    let runtime = ToolRuntime::new(config)?;
    load_user_scripts(&runtime);
    if let Err(e) = connect_owner(&runtime, &tool).await {
        let failure = ToolInvocationResult::failure(e.kind(), e.to_string(), None, 0);
        print_json(&json!(failure))?;
        return Ok(1);
    }

    if args.help {
        let descriptor = runtime
            .registry()
            .get(&tool)
            .ok_or_else(|| EngineError::UnknownTool(tool.clone()))?;
        print_json(&json!(descriptor))?;
        runtime.shutdown().await;
        return Ok(0);
    }

    let deadline = args
        .timeout_ms
        .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
    let result = runtime.dispatch(&tool, &arguments, deadline).await;
    print_json(&json!(result))?;
    runtime.shutdown().await;
    Ok(if result.success { 0 } else { 1 })
}

/// Connect only the connector or server whose prefix owns `tool`.
async fn connect_owner(runtime: &ToolRuntime, tool: &str) -> EngineResult<()> {
    if runtime.registry().contains(tool) {
        return Ok(());
    }
    let config = runtime.config();
    let connector = BUILTIN_CONNECTORS
        .iter()
        .map(|n| n.to_string())
        .filter(|n| config.connectors.get(n).map(|c| c.enabled).unwrap_or(true));
    let servers = config.enabled_servers().map(|s| s.name.clone());
    let owner = connector
        .chain(servers)
        .filter(|name| tool.starts_with(&format!("{}_", name)))
        .max_by_key(|name| name.len());

    let Some(owner) = owner else { return Ok(()) };
    let count = match config.enabled_servers().find(|s| s.name == owner) {
        Some(server) => runtime.connect_server(&server.clone()).await?,
        None => runtime.connect_connector(&owner).await?,
    };
    info!("[mcp] Connected '{}' ({} tools)", owner, count);
    Ok(())
}

fn print_json(value: &Value) -> EngineResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
