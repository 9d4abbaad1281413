//! Rocketship command-line interface.
//!
//! Exit codes: 0 when every submitted suite passes, 1 when any test fails,
//! 2 on configuration or I/O errors.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use rocketship_server::{ServerConfig, SessionFile};
use rocketship_types::{LogColor, LogLine, RunStatus};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::Level;

const DEFAULT_ENGINE: &str = "http://127.0.0.1:7700";

#[derive(Parser)]
#[command(name = "rocketship", about = "Distributed integration testing", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit one or more suites and stream their logs.
    Run(RunArgs),
    /// List known runs on the engine.
    List {
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        profile: Option<String>,
    },
    /// Show one run's summary.
    Get {
        run_id: String,
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        profile: Option<String>,
    },
    /// Start long-lived components.
    Start {
        #[command(subcommand)]
        target: StartTarget,
    },
    /// Stop long-lived components.
    Stop {
        #[command(subcommand)]
        target: StopTarget,
    },
}

#[derive(Subcommand)]
enum StartTarget {
    /// Run the engine server in the foreground.
    Server,
}

#[derive(Subcommand)]
enum StopTarget {
    /// Stop a locally started engine server.
    Server {
        #[arg(long)]
        engine: Option<String>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Suite file to run (default: rocketship.yaml).
    #[arg(long, short = 'f')]
    file: Option<PathBuf>,
    /// Run every *.yaml / *.yml suite in this directory.
    #[arg(long, short = 'd')]
    dir: Option<PathBuf>,
    /// Environment overrides in dotenv format.
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,
    /// Variable overrides, `key=value` with dotted keys for nesting.
    #[arg(long = "var")]
    vars: Vec<String>,
    /// Variable overrides from a YAML mapping file.
    #[arg(long = "var-file")]
    var_file: Option<PathBuf>,
    /// Start an ephemeral in-process engine for this invocation.
    #[arg(long)]
    auto: bool,
    /// Engine base URL.
    #[arg(long)]
    engine: Option<String>,
    /// Named connection profile.
    #[arg(long)]
    profile: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(all_passed) => {
            if all_passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("ROCKETSHIP_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .try_init();
}

async fn dispatch(cli: Cli) -> Result<bool> {
    match cli.command {
        Command::Run(args) => run_suites(args).await,
        Command::List { engine, profile } => {
            let connection = Connection::resolve(engine, profile)?;
            let body: JsonValue = connection
                .get("/v1/runs")
                .await
                .context("failed to list runs")?;
            let empty = Vec::new();
            let runs = body["runs"].as_array().unwrap_or(&empty);
            for run in runs {
                println!(
                    "{}  {:10}  {}  {}",
                    run["run_id"].as_str().unwrap_or("?"),
                    run["status"].as_str().unwrap_or("?"),
                    run["started_at"].as_str().unwrap_or("?"),
                    run["suite_name"].as_str().unwrap_or("?"),
                );
            }
            Ok(true)
        }
        Command::Get { run_id, engine, profile } => {
            let connection = Connection::resolve(engine, profile)?;
            let body: JsonValue = connection
                .get(&format!("/v1/runs/{run_id}"))
                .await
                .with_context(|| format!("failed to fetch run '{run_id}'"))?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(true)
        }
        Command::Start { target: StartTarget::Server } => {
            let config = ServerConfig::from_env()?;
            rocketship_server::serve(config).await?;
            Ok(true)
        }
        Command::Stop { target: StopTarget::Server { engine } } => {
            let base = match engine {
                Some(engine) => engine,
                None => session_engine_url()?,
            };
            let connection = Connection::new(base);
            let _: JsonValue = connection
                .post("/v1/admin/shutdown", &JsonValue::Null)
                .await
                .context("failed to stop the server")?;
            println!("server stopped");
            Ok(true)
        }
    }
}

async fn run_suites(args: RunArgs) -> Result<bool> {
    let suite_paths = collect_suite_paths(&args)?;
    if suite_paths.is_empty() {
        bail!("no suite files found");
    }

    let env_overrides = collect_env_overrides(&args)?;
    let var_overrides = collect_var_overrides(&args)?;

    // --auto runs everything against an ephemeral in-process engine.
    let auto_server = if args.auto {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().context("auto listen addr")?,
            ..ServerConfig::from_env()?
        };
        Some(rocketship_server::spawn(config, None).await?)
    } else {
        None
    };
    let connection = match &auto_server {
        Some(handle) => Connection::new(format!("http://{}", handle.addr)),
        None => Connection::resolve(args.engine.clone(), args.profile.clone())?,
    };

    let mut all_passed = true;
    for path in &suite_paths {
        let passed = submit_and_stream(&connection, path, &env_overrides, &var_overrides)
            .await
            .with_context(|| format!("suite '{}' failed to execute", path.display()))?;
        all_passed &= passed;
    }

    if let Some(handle) = auto_server {
        handle.shutdown().await?;
    }
    Ok(all_passed)
}

async fn submit_and_stream(
    connection: &Connection,
    path: &Path,
    env_overrides: &HashMap<String, String>,
    var_overrides: &JsonValue,
) -> Result<bool> {
    let suite_yaml = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let created: JsonValue = connection
        .post(
            "/v1/runs",
            &serde_json::json!({
                "suite_yaml": suite_yaml,
                "env": env_overrides,
                "vars": var_overrides,
                "initiator": "cli",
            }),
        )
        .await
        .context("CreateRun failed")?;
    let run_id = created["run_id"]
        .as_str()
        .context("CreateRun returned no run_id")?
        .to_string();
    println!("run {run_id} started ({})", path.display());

    connection.stream_logs(&run_id).await?;

    let summary: JsonValue = connection.get(&format!("/v1/runs/{run_id}")).await?;
    let status: RunStatus = serde_json::from_value(summary["status"].clone())
        .context("engine returned an unknown run status")?;
    Ok(status == RunStatus::Passed)
}

fn collect_suite_paths(args: &RunArgs) -> Result<Vec<PathBuf>> {
    if let Some(file) = &args.file {
        return Ok(vec![file.clone()]);
    }
    if let Some(dir) = &args.dir {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|extension| extension.to_str()),
                    Some("yaml" | "yml")
                )
            })
            .collect();
        paths.sort();
        return Ok(paths);
    }
    let default = PathBuf::from("rocketship.yaml");
    if default.exists() {
        Ok(vec![default])
    } else {
        Ok(Vec::new())
    }
}

fn collect_env_overrides(args: &RunArgs) -> Result<HashMap<String, String>> {
    let mut overrides = HashMap::new();
    if let Some(env_file) = &args.env_file {
        for item in dotenvy::from_path_iter(env_file)
            .with_context(|| format!("failed to read env file {}", env_file.display()))?
        {
            let (key, value) = item.context("malformed env file entry")?;
            overrides.insert(key, value);
        }
    }
    Ok(overrides)
}

fn collect_var_overrides(args: &RunArgs) -> Result<JsonValue> {
    let mut vars = JsonValue::Object(serde_json::Map::new());

    if let Some(var_file) = &args.var_file {
        let text = std::fs::read_to_string(var_file)
            .with_context(|| format!("failed to read var file {}", var_file.display()))?;
        let parsed: JsonValue =
            serde_yaml::from_str(&text).context("var file is not a YAML mapping")?;
        if !parsed.is_object() {
            bail!("var file must contain a mapping at the top level");
        }
        vars = parsed;
    }

    for assignment in &args.vars {
        let (key, value) = assignment
            .split_once('=')
            .with_context(|| format!("--var '{assignment}' is not of the form key=value"))?;
        insert_dotted(&mut vars, key, JsonValue::String(value.to_string()));
    }
    Ok(vars)
}

/// Insert `value` at a dotted path, creating intermediate objects.
fn insert_dotted(vars: &mut JsonValue, dotted_key: &str, value: JsonValue) {
    let mut current = vars;
    let segments: Vec<&str> = dotted_key.split('.').collect();
    for (position, segment) in segments.iter().enumerate() {
        let map = match current {
            JsonValue::Object(map) => map,
            other => {
                *other = JsonValue::Object(serde_json::Map::new());
                match other {
                    JsonValue::Object(map) => map,
                    _ => return,
                }
            }
        };
        if position + 1 == segments.len() {
            map.insert((*segment).to_string(), value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
    }
}

fn session_engine_url() -> Result<String> {
    let run_dir = std::env::var("ROCKETSHIP_RUN_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("rocketship"));
    let path = SessionFile::path(&run_dir);
    let text = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "no engine session file at {}; pass --engine explicitly",
            path.display()
        )
    })?;
    let session: SessionFile = serde_json::from_str(&text).context("malformed session file")?;
    Ok(format!("http://{}", session.addr))
}

/// A resolved engine endpoint plus optional bearer credentials.
struct Connection {
    base: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Connection {
    fn new(base: String) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            token: std::env::var("ROCKETSHIP_TOKEN").ok(),
            http: reqwest::Client::new(),
        }
    }

    /// Resolve the endpoint: explicit flag, then profile, then the local
    /// session file, then the default address.
    fn resolve(engine: Option<String>, profile: Option<String>) -> Result<Self> {
        if let Some(engine) = engine {
            return Ok(Self::new(engine));
        }
        if let Some(profile) = profile {
            return Profile::load(&profile).map(|profile| {
                let mut connection = Self::new(profile.engine);
                if profile.token.is_some() {
                    connection.token = profile.token;
                }
                connection
            });
        }
        if let Ok(engine) = session_engine_url() {
            return Ok(Self::new(engine));
        }
        Ok(Self::new(DEFAULT_ENGINE.to_string()))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn get(&self, path: &str) -> Result<JsonValue> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        decode_response(response).await
    }

    async fn post(&self, path: &str, body: &JsonValue) -> Result<JsonValue> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await?;
        decode_response(response).await
    }

    /// Stream a run's NDJSON log lines to stdout with terminal colours.
    async fn stream_logs(&self, run_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/runs/{run_id}/logs"))
            .send()
            .await?
            .error_for_status()
            .context("StreamLogs failed")?;

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("log stream interrupted")?;
            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if let Ok(log_line) = serde_json::from_slice::<LogLine>(&line) {
                    print_log_line(&log_line);
                }
            }
        }
        Ok(())
    }
}

async fn decode_response(response: reqwest::Response) -> Result<JsonValue> {
    let status = response.status();
    let body: JsonValue = response.json().await.unwrap_or(JsonValue::Null);
    if !status.is_success() {
        let code = body["code"].as_str().unwrap_or("UNKNOWN");
        let message = body["message"].as_str().unwrap_or("request failed");
        bail!("{code}: {message}");
    }
    Ok(body)
}

fn print_log_line(line: &LogLine) {
    let prefix = match (line.test_name.is_empty(), line.step_name.is_empty()) {
        (false, false) => format!("[{} / {}] ", line.test_name, line.step_name),
        (false, true) => format!("[{}] ", line.test_name),
        _ => String::new(),
    };
    let color_code = match line.color {
        LogColor::Green => "\x1b[32m",
        LogColor::Red => "\x1b[31m",
        LogColor::Purple => "\x1b[35m",
        LogColor::None => "",
    };
    let bold_code = if line.bold { "\x1b[1m" } else { "" };
    let reset = if color_code.is_empty() && bold_code.is_empty() {
        ""
    } else {
        "\x1b[0m"
    };
    println!("{bold_code}{color_code}{prefix}{}{reset}", line.msg);
}

/// Named connection profile stored under the user's config directory.
#[derive(serde::Deserialize)]
struct Profile {
    engine: String,
    #[serde(default)]
    token: Option<String>,
}

impl Profile {
    fn load(name: &str) -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set; cannot resolve profiles")?;
        let path = PathBuf::from(home)
            .join(".config")
            .join("rocketship")
            .join("profiles.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read profiles file {}", path.display()))?;
        let profiles: HashMap<String, Profile> =
            serde_yaml::from_str(&text).context("malformed profiles file")?;
        profiles
            .into_iter()
            .find_map(|(profile_name, profile)| (profile_name == name).then_some(profile))
            .with_context(|| format!("profile '{name}' not found in {}", path.display()))
    }
}
