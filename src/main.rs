use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use mibridge::cloud::{Device, MinaService, SessionManager};
use mibridge::speech::SpeechSink;
use mibridge::{
    Config, Console, Engine, HomeAssistantClient, IntentRouter, SpeechDispatcher,
    StreamingChatClient,
};

/// mibridge - answer smart-speaker queries with chat and home-automation backends
#[derive(Parser)]
#[command(name = "mibridge", version, about)]
struct Cli {
    /// Config file (default: ~/.config/mibridge/config.toml)
    #[arg(short, long, env = "MIBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the selected speakers and answer their queries (default)
    Run {
        /// Do not read console commands from stdin
        #[arg(long)]
        no_console: bool,
    },
    /// List the speakers on the account
    Devices,
    /// Speak text on a speaker
    Say {
        /// Text to speak
        text: String,
        /// Speaker number from `devices` (default: primary)
        #[arg(short, long)]
        device: Option<usize>,
    },
    /// Set playback volume (0-100)
    Volume {
        level: u8,
        #[arg(short, long)]
        device: Option<usize>,
    },
    /// Pause playback
    Pause {
        #[arg(short, long)]
        device: Option<usize>,
    },
    /// Resume playback
    Play {
        #[arg(short, long)]
        device: Option<usize>,
    },
    /// Delete the saved cloud credentials
    Logout,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info",
        1 => "info,mibridge=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    let client = reqwest::Client::builder()
        .user_agent(concat!("mibridge/", env!("CARGO_PKG_VERSION")))
        .build()?;

    if matches!(cli.command, Some(Command::Logout)) {
        SessionManager::from_config(&config, client).logout().await?;
        println!("Removed {}", config.account.token_path.display());
        return Ok(());
    }

    config.require_account()?;
    let session = Arc::new(SessionManager::from_config(&config, client.clone()));
    let mina = Arc::new(MinaService::new(session, &config));

    match cli.command {
        None => run_bridge(config, client, mina, false).await,
        Some(Command::Run { no_console }) => run_bridge(config, client, mina, no_console).await,
        Some(Command::Devices) => list_devices(&mina, &config).await,
        Some(Command::Say { text, device }) => {
            let target = pick_device(&mina, &config, device).await?;
            mina.speak(&target.id, &text).await?;
            println!("Spoke on {}", target.display_name());
            Ok(())
        }
        Some(Command::Volume { level, device }) => {
            let target = pick_device(&mina, &config, device).await?;
            mina.player_set_volume(&target.id, level).await?;
            println!("Volume of {} set to {level}", target.display_name());
            Ok(())
        }
        Some(Command::Pause { device }) => {
            let target = pick_device(&mina, &config, device).await?;
            mina.player_pause(&target.id).await?;
            println!("Paused {}", target.display_name());
            Ok(())
        }
        Some(Command::Play { device }) => {
            let target = pick_device(&mina, &config, device).await?;
            mina.player_play(&target.id).await?;
            println!("Resumed {}", target.display_name());
            Ok(())
        }
        Some(Command::Logout) => Ok(()),
    }
}

/// Build the engine and console and run until exit
async fn run_bridge(
    config: Config,
    client: reqwest::Client,
    mina: Arc<MinaService>,
    no_console: bool,
) -> anyhow::Result<()> {
    tracing::info!(
        model = %config.chat.model,
        api_type = %config.chat.api_type,
        home_assistant = config.home_assistant.is_configured(),
        "starting mibridge"
    );

    let devices = mina.device_list().await?;
    let speech = Arc::new(SpeechDispatcher::new(Arc::clone(&mina) as Arc<dyn SpeechSink>));
    let router = IntentRouter::from_config(&config);
    let chat: Arc<dyn mibridge::ChatBackend> =
        Arc::new(StreamingChatClient::new(config.chat.clone(), client.clone())?);

    let mut engine = Engine::new(mina, Arc::clone(&speech), router.clone(), &config)
        .with_chat(Arc::clone(&chat));
    if let Some(home) = HomeAssistantClient::from_config(&config.home_assistant, client) {
        engine = engine.with_home(Arc::new(home));
    }

    engine.start(&devices, &config.devices).await?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_c_tx.send(()).await;
        }
    });

    if !no_console {
        let console = Console::new(engine.state(), devices, router, speech, shutdown_tx)
            .with_chat(chat);
        tokio::spawn(async move {
            if let Err(e) = console.run().await {
                tracing::warn!(error = %e, "console stopped");
            }
        });
    }

    engine.run(shutdown_rx).await?;
    tracing::info!("mibridge stopped");
    Ok(())
}

async fn list_devices(mina: &MinaService, config: &Config) -> anyhow::Result<()> {
    let devices = mina.device_list().await?;
    if devices.is_empty() {
        return Err(mibridge::Error::NoDevicesFound.into());
    }

    for (i, device) in devices.iter().enumerate() {
        let primary = if device.hardware == config.devices.hardware {
            " *"
        } else {
            ""
        };
        println!(
            "{}. {} [{}] {}{primary}",
            i + 1,
            device.display_name(),
            device.hardware,
            device.id
        );
    }
    Ok(())
}

/// Device by 1-based number, or the primary device
async fn pick_device(
    mina: &MinaService,
    config: &Config,
    number: Option<usize>,
) -> anyhow::Result<Device> {
    let devices = mina.device_list().await?;
    let device = match number {
        Some(n) => n
            .checked_sub(1)
            .and_then(|i| devices.get(i))
            .ok_or_else(|| anyhow::anyhow!("no device number {n}, see `mibridge devices`"))?,
        None => mibridge::engine::primary_device(&devices, &config.devices.hardware)
            .ok_or(mibridge::Error::NoDevicesFound)?,
    };
    Ok(device.clone())
}
