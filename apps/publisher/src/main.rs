mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser};
use tracing::{debug, info, warn};
use url::Url;

use logging::{LogConfig, LogLevel};
use publish_signaling::{
    DEFAULT_STUN_SERVER, GatheringPolicy, NegotiationState, PublishConfig, publish,
};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = PublishConfig::try_from(cli)?;

    let mut session = publish(&config)
        .await
        .context("failed to start publish session")?;

    tokio::select! {
        result = session.wait_established() => match result {
            Ok(()) => info!(
                application = %config.application_name,
                stream = %config.stream_name,
                "publish session established"
            ),
            Err(err) => warn!(error = %err, "publish session ended before it was established"),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; closing publish session");
            session.close();
        }
    }

    if !session.state().is_terminal() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; closing publish session");
                session.close();
            }
            state = session.wait_finished() => debug!(state = ?state, "publish session ended"),
        }
    }

    let outcome = session.join().await.context("publish session task")?;
    info!(
        state = ?outcome.state,
        established = outcome.established,
        server_session_id = outcome.server_session_id.as_deref().unwrap_or("-"),
        "publish session finished"
    );
    match outcome.state {
        NegotiationState::Failed(err) => bail!("publish failed: {err}"),
        _ => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "publisher",
    about = "Publish a WebRTC stream to a media server over WebSocket signaling",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        env = "PUBLISH_ENDPOINT",
        value_name = "URL",
        help = "Signaling endpoint (ws://, wss://, http:// or https://)"
    )]
    endpoint: String,

    #[arg(
        long,
        env = "PUBLISH_APPLICATION",
        value_name = "NAME",
        help = "Server-side application name"
    )]
    application: String,

    #[arg(long, env = "PUBLISH_STREAM", value_name = "NAME", help = "Stream name to publish")]
    stream: String,

    #[arg(
        long = "ice-server",
        env = "PUBLISH_ICE_SERVERS",
        value_delimiter = ',',
        value_name = "URL",
        default_value = DEFAULT_STUN_SERVER,
        help = "STUN/TURN server urls, comma separated"
    )]
    ice_servers: Vec<String>,

    #[arg(
        long,
        env = "PUBLISH_GATHERING",
        default_value = "first-candidate",
        help = "When to send the offer: first-candidate or complete"
    )]
    gathering: String,

    #[arg(
        long = "step-timeout",
        env = "PUBLISH_STEP_TIMEOUT_SECS",
        value_name = "SECS",
        help = "Fail when a negotiation step takes longer than this"
    )]
    step_timeout_secs: Option<u64>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PUBLISH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PUBLISH_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl TryFrom<Cli> for PublishConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let endpoint = Url::parse(&cli.endpoint)
            .with_context(|| format!("invalid endpoint url {:?}", cli.endpoint))?;
        let gathering: GatheringPolicy = cli.gathering.parse()?;
        let ice_servers = cli
            .ice_servers
            .into_iter()
            .map(|server| server.trim().to_string())
            .filter(|server| !server.is_empty())
            .collect();
        Ok(PublishConfig::new(endpoint, cli.application, cli.stream)
            .with_ice_servers(ice_servers)
            .with_gathering(gathering)
            .with_step_timeout(cli.step_timeout_secs.map(Duration::from_secs)))
    }
}
