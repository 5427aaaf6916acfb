mod config_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    switchyard_service_traits::Services,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "switchyard", about = "Switchyard: tool and transfer router for nodes and clients")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Custom config directory (overrides default ~/.config/switchyard/).
    #[arg(long, global = true, env = "SWITCHYARD_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    /// Custom data directory (overrides default data dir).
    #[arg(long, global = true, env = "SWITCHYARD_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the router (default when no subcommand is provided).
    Gateway,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
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
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(ref dir) = cli.config_dir {
        switchyard_config::set_config_dir(dir.clone());
    }
    if let Some(ref dir) = cli.data_dir {
        switchyard_config::set_data_dir(dir.clone());
    }

    match cli.command {
        None | Some(Commands::Gateway) => {
            info!(version = env!("CARGO_PKG_VERSION"), "switchyard starting");
            let mut config = switchyard_config::discover_and_load();
            if let Some(bind) = cli.bind {
                config.server.bind = bind;
            }
            if let Some(port) = cli.port {
                config.server.port = port;
            }

            let report = switchyard_config::validate(&config);
            for d in &report.diagnostics {
                tracing::warn!(path = d.path, severity = %d.severity, "config: {}", d.message);
            }
            if report.has_errors() {
                anyhow::bail!("invalid configuration; run `switchyard config check` for details");
            }

            let data_dir = switchyard_config::data_dir();
            switchyard_gateway::server::start_gateway(config, &data_dir, Services::default())
                .await
        },
        Some(Commands::Config { action }) => config_commands::handle_config(action),
    }
}
