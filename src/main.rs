//! Shot server binary.
//!
//! Wires configuration, the instrument transport, the lifecycle controller,
//! and the command dispatcher together, then serves orchestrator commands
//! over a newline-delimited TCP loop. The loop is transport glue only; all
//! protocol behavior lives in [`scope_daq::server`].

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use scope_daq::config::Settings;
use scope_daq::error::ShotResult;
use scope_daq::server::{CommandDispatcher, CommandLink};

#[derive(Parser)]
#[command(
    name = "scope_daq",
    about = "Shot-sequenced oscilloscope acquisition service"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured resource match substring.
    #[arg(long)]
    resource: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scope_daq=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(resource) = args.resource {
        settings.device.resource_match = resource;
    }

    let dispatcher = build_service(&settings).await?;
    serve(&settings, dispatcher).await
}

#[cfg(all(feature = "instrument_visa", feature = "storage_hdf5"))]
async fn build_service(settings: &Settings) -> Result<CommandDispatcher> {
    use std::sync::Arc;

    use scope_daq::data::storage::Hdf5Store;
    use scope_daq::instrument::visa::VisaBus;
    use scope_daq::instrument::ScopeInterface;
    use scope_daq::lifecycle::ShotController;

    let bus = VisaBus::new()?;
    let scope = ScopeInterface::connect(
        &bus,
        &settings.device.resource_match,
        settings.device.settle_delay,
    )
    .await?;
    let store = Arc::new(Hdf5Store::new());
    let controller = ShotController::new(settings, scope, store.clone(), store);
    Ok(CommandDispatcher::new(settings, controller))
}

#[cfg(not(all(feature = "instrument_visa", feature = "storage_hdf5")))]
async fn build_service(_settings: &Settings) -> Result<CommandDispatcher> {
    anyhow::bail!(
        "serving hardware requires both the instrument_visa and storage_hdf5 features. \
         Rebuild with --features instrument_visa,storage_hdf5"
    )
}

async fn serve(settings: &Settings, mut dispatcher: CommandDispatcher) -> Result<()> {
    let listener = TcpListener::bind(&settings.service.listen_addr).await?;
    info!(addr = %settings.service.listen_addr, "listening for orchestrator commands");

    // One connection and one command at a time: the protocol is strictly
    // synchronous request/reply over a single instrument.
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "orchestrator connected");
        if let Err(err) = handle_connection(stream, &mut dispatcher).await {
            warn!(%err, "connection closed with error");
        }
    }
}

async fn handle_connection(stream: TcpStream, dispatcher: &mut CommandDispatcher) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut link = TcpLink {
        reader: BufReader::new(read_half).lines(),
        writer: write_half,
    };

    loop {
        let Some(request) = link.reader.next_line().await? else {
            return Ok(());
        };
        match dispatcher.dispatch(request.trim(), &mut link).await {
            Ok(reply) => link.send(&reply).await?,
            Err(err) => {
                warn!(%err, request = request.trim(), "command failed");
                link.send(&format!("error: {err}")).await?;
            }
        }
    }
}

struct TcpLink {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

#[async_trait]
impl CommandLink for TcpLink {
    async fn send(&mut self, reply: &str) -> ShotResult<()> {
        self.writer.write_all(reply.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn recv(&mut self) -> ShotResult<String> {
        Ok(self.reader.next_line().await?.unwrap_or_default())
    }
}
