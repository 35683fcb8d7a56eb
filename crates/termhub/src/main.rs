use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use termhub::api::{AppState, create_router};
use termhub::bootstrap::Bootstrap;
use termhub::config::AppConfig;
use termhub::exec::{CommandExecutor, ExecutorConfig};
use termhub::gateway::StreamingGateway;
use termhub::isolation::{IsolationBackend, build_backend};
use termhub::session::{RegistryConfig, SessionRegistry};

const APP_NAME: &str = "termhub";

fn main() {
    if let Err(err) = run() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = Paths::resolve(cli.global.config.as_deref())?;
    let config = load_config(&paths)?;
    let paths = paths.with_config(&config)?;

    init_logging(&cli.global, &config);
    debug!(
        "config file {}, data dir {}",
        paths.config_file.display(),
        paths.data_dir.display()
    );

    match cli.command {
        Command::Serve(opts) => {
            fs::create_dir_all(&paths.data_dir).with_context(|| {
                format!("creating data directory {}", paths.data_dir.display())
            })?;
            serve(config, paths, opts)
        }
        Command::Init { force } => {
            if paths.config_file.exists() && !force {
                return Err(anyhow!(
                    "config already exists at {} (use --force to overwrite)",
                    paths.config_file.display()
                ));
            }
            write_default_config(&paths.config_file)
        }
        Command::Config { command } => match command {
            ConfigCommand::Show => print_config(&config, cli.global.json),
            ConfigCommand::Path => {
                println!("{}", paths.config_file.display());
                Ok(())
            }
            ConfigCommand::Reset => write_default_config(&paths.config_file),
        },
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "termhub - multi-tenant command execution server.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct GlobalOpts {
    /// Config file (or directory containing config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// More logging (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,
    /// Trace logging
    #[arg(long, global = true)]
    trace: bool,
    /// JSON log lines and JSON output from `config show`
    #[arg(long, global = true)]
    json: bool,
    /// Never color log output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto, global = true)]
    color: ColorChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP and WebSocket server
    Serve(ServeOpts),
    /// Write the default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeOpts {
    /// Bind address (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Listen port (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
    /// Shared API key (overrides auth.api_key)
    #[arg(long, env = "TERMHUB_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

fn log_level(opts: &GlobalOpts, config: &AppConfig) -> LevelFilter {
    if opts.quiet {
        return LevelFilter::Error;
    }
    if opts.trace || opts.verbose >= 2 {
        return LevelFilter::Trace;
    }
    if opts.debug || opts.verbose == 1 {
        return LevelFilter::Debug;
    }
    config.logging.level.parse().unwrap_or(LevelFilter::Info)
}

/// Install the tracing subscriber (HTTP layer, api) and env_logger (services).
fn init_logging(opts: &GlobalOpts, config: &AppConfig) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = log_level(opts, config);
    let directive = level.to_string().to_ascii_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("termhub={directive},tower_http={directive}")));

    let registry = tracing_subscriber::registry().with(filter);
    if opts.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        let ansi = match opts.color {
            _ if opts.no_color || env::var_os("NO_COLOR").is_some() => false,
            ColorChoice::Never => false,
            ColorChoice::Always => true,
            ColorChoice::Auto => {
                env::var_os("FORCE_COLOR").is_some() || io::stderr().is_terminal()
            }
        };
        registry
            .with(tracing_subscriber::fmt::layer().with_ansi(ansi))
            .try_init()
            .ok();
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_level(level)
        .try_init()
        .ok();
}

/// Where the server keeps its config and data.
#[derive(Debug, Clone)]
struct Paths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl Paths {
    fn resolve(config_override: Option<&Path>) -> Result<Self> {
        let config_file = match config_override {
            Some(path) => {
                let path = expand(&path.to_string_lossy())?;
                if path.is_dir() {
                    path.join("config.toml")
                } else {
                    path
                }
            }
            None => xdg_dir("XDG_CONFIG_HOME", dirs::config_dir(), ".config")?.join("config.toml"),
        };
        Ok(Self {
            config_file,
            data_dir: xdg_dir("XDG_DATA_HOME", dirs::data_dir(), ".local/share")?,
        })
    }

    fn with_config(mut self, config: &AppConfig) -> Result<Self> {
        if let Some(ref dir) = config.paths.data_dir {
            self.data_dir = expand(dir)?;
        }
        Ok(self)
    }
}

/// `$VAR/termhub`, else the platform directory, else `~/<fallback>/termhub`.
fn xdg_dir(var: &str, platform: Option<PathBuf>, fallback: &str) -> Result<PathBuf> {
    if let Some(dir) = env::var_os(var).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }
    if let Some(dir) = platform {
        return Ok(dir.join(APP_NAME));
    }
    dirs::home_dir()
        .map(|home| home.join(fallback).join(APP_NAME))
        .ok_or_else(|| anyhow!("cannot determine {var} directory"))
}

fn expand(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).with_context(|| format!("expanding {text}"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Defaults, then the TOML file, then `TERMHUB__SECTION__KEY` variables.
fn load_config(paths: &Paths) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }

    Config::builder()
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&APP_NAME.to_ascii_uppercase()).separator("__"))
        .build()
        .context("reading configuration")?
        .try_deserialize()
        .context("parsing configuration")
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    let body = toml::to_string_pretty(&AppConfig::default()).context("serializing defaults")?;
    fs::write(path, format!("# {APP_NAME} configuration\n\n{body}"))
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote default config to {}", path.display());
    Ok(())
}

fn print_config(config: &AppConfig, json: bool) -> Result<()> {
    let text = if json {
        serde_json::to_string_pretty(config).context("serializing config to JSON")?
    } else {
        toml::to_string_pretty(config).context("serializing config to TOML")?
    };
    println!("{text}");
    Ok(())
}

#[tokio::main]
async fn serve(config: AppConfig, paths: Paths, opts: ServeOpts) -> Result<()> {
    let bootstrap = Arc::new(Bootstrap::resolve(&config.bootstrap)?);
    let backend = build_backend(&config, &paths.data_dir, bootstrap, None)
        .context("initializing isolation backend")?;
    info!(
        "Isolation backend: {} (persistent: {})",
        backend.kind(),
        backend.is_persistent()
    );

    let registry = Arc::new(SessionRegistry::new(
        backend.clone(),
        RegistryConfig::from_config(&config.sessions),
    ));
    let executor = Arc::new(CommandExecutor::new(
        backend.clone(),
        ExecutorConfig::from_config(&config.exec),
    ));
    let gateway = Arc::new(StreamingGateway::new(
        registry.clone(),
        executor,
        config.gateway.clone(),
    ));

    let warmed = registry.fill_prewarm().await;
    if warmed > 0 {
        info!("Pre-warmed {} session handle(s)", warmed);
    }
    let sweep_every = Duration::from_secs(config.sessions.sweep_interval_secs.max(1));
    let tasks = vec![
        registry.clone().start_prewarmer(),
        registry.clone().start_sweeper(sweep_every),
        gateway.clone().start_expiry_listener(),
        gateway.clone().start_pruner(),
    ];

    let api_key = opts.api_key.or_else(|| config.auth.api_key.clone());
    if api_key.is_none() {
        warn!("No API key configured; anyone who can reach the server can use it");
    }
    let app = create_router(
        AppState::new(gateway.clone())
            .with_api_key(api_key)
            .with_allowed_origins(config.server.allowed_origins.clone()),
    );

    let host = opts.host.unwrap_or_else(|| config.server.host.clone());
    let port = opts.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            drain(tasks, &gateway, backend.as_ref()).await;
        })
        .await
        .context("running server")
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Stop background tasks, cancel jobs, end sessions and tear down containers.
async fn drain(tasks: Vec<JoinHandle<()>>, gateway: &StreamingGateway, backend: &dyn IsolationBackend) {
    for task in tasks {
        task.abort();
    }
    gateway.shutdown().await;
    if let Some(pool) = backend.pool() {
        pool.shutdown().await;
    }
    info!("Shutdown complete");
}
