mod deploy_commands;
mod plugin_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    mcpdock_hub::PluginRepository,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "mcpdock", about = "mcpdock: install, deploy and query MCP tool plugins")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Directory holding mcpdock.toml (overrides ./ and ~/.config/mcpdock/).
    #[arg(long, global = true, env = "MCPDOCK_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    /// Directory for the plugin document and sandboxes.
    #[arg(long, global = true, env = "MCPDOCK_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List every visible plugin (default when no subcommand is given).
    List {
        /// Query plugins for their tools first.
        #[arg(long)]
        refresh: bool,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Merge a Claude/Cursor style `mcpServers` document into the store.
    Import {
        /// Path to the JSON document.
        file: PathBuf,
    },
    /// Install a plugin from a GitHub repository (owner/repo or URL).
    Install {
        source: String,
        /// Id to install under instead of the repository name.
        #[arg(long)]
        id: Option<String>,
    },
    /// Install a plugin from a local zip archive.
    InstallZip {
        archive: PathBuf,
        /// Plugin name; the id is derived from it.
        #[arg(long)]
        name: String,
    },
    /// Register a remote MCP endpoint.
    Connect {
        name: String,
        endpoint: String,
        /// Use the legacy SSE transport instead of streamable HTTP.
        #[arg(long)]
        sse: bool,
        /// Bearer token sent with every request.
        #[arg(long, env = "MCPDOCK_BEARER_TOKEN")]
        token: Option<String>,
    },
    /// Uninstall a plugin and remove every trace of it.
    Remove { id: String },
    /// Enable a plugin.
    Enable { id: String },
    /// Disable a plugin.
    Disable { id: String },
    /// Show or set a plugin's raw JSON configuration.
    Config {
        id: String,
        /// New configuration (JSON text).
        #[arg(long)]
        set: Option<String>,
    },
    /// Show the commands a deploy would run.
    Commands { id: String },
    /// Build a plugin in its sandbox and start its service.
    Deploy {
        #[command(flatten)]
        args: deploy_commands::DeployArgs,
    },
    /// Print `{plugin -> tools}` for every enabled plugin.
    Tools {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

async fn open_repository(cli: &Cli) -> anyhow::Result<PluginRepository> {
    let mut config = mcpdock_config::discover_and_load(cli.config_dir.as_deref());
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    PluginRepository::open(&config).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);
    info!(version = env!("CARGO_PKG_VERSION"), "mcpdock starting");

    let repo = open_repository(&cli).await?;
    let result = match cli.command {
        None => plugin_commands::list(&repo, false, false).await,
        Some(Commands::List { refresh, json }) => plugin_commands::list(&repo, refresh, json).await,
        Some(Commands::Import { file }) => plugin_commands::import(&repo, &file).await,
        Some(Commands::Install { source, id }) => {
            plugin_commands::install(&repo, &source, id.as_deref()).await
        },
        Some(Commands::InstallZip { archive, name }) => {
            plugin_commands::install_zip(&repo, &archive, &name).await
        },
        Some(Commands::Connect {
            name,
            endpoint,
            sse,
            token,
        }) => plugin_commands::connect(&repo, &name, &endpoint, sse, token).await,
        Some(Commands::Remove { id }) => plugin_commands::remove(&repo, &id).await,
        Some(Commands::Enable { id }) => plugin_commands::set_enabled(&repo, &id, true).await,
        Some(Commands::Disable { id }) => plugin_commands::set_enabled(&repo, &id, false).await,
        Some(Commands::Config { id, set }) => plugin_commands::config(&repo, &id, set).await,
        Some(Commands::Commands { id }) => deploy_commands::show_commands(&repo, &id).await,
        Some(Commands::Deploy { args }) => deploy_commands::deploy(&repo, args).await,
        Some(Commands::Tools { json }) => plugin_commands::tools(&repo, json).await,
    };
    repo.shutdown().await;
    result
}
