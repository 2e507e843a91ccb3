mod config;
mod gateway;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use skyrelay_fc::actions::{Commander, VehicleActions};
use skyrelay_fc::link::{TelemetrySource, VehicleLink};
use skyrelay_fc::mav::MavSource;
use skyrelay_fc::mock::MockSource;
use skyrelay_fc::{doctor as fc_doctor, VehicleConfig};
use skyrelay_hub::{doctor as hub_doctor, TelemetryHub};
use skyrelay_rpc::{RpcError, SimConnector, Value};
use skyrelay_video::camera::CameraSource;
use skyrelay_video::{codec, doctor as video_doctor, Camera};

use crate::config::{load_config, Config, DEFAULT_API_KEY};
use crate::gateway::AppState;

#[derive(Debug, Parser)]
#[command(name = "skyrelay", version, about = "skyrelay - vehicle telemetry and simulator camera relay")]
struct Cli {
    #[arg(long)]
    config: Option<String>,

    /// Generate synthetic telemetry instead of connecting to a vehicle.
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration.
    Doctor,
    /// Start the link supervisor and the HTTP gateway.
    Run,
    /// Connect to the simulator RPC port, ping it and fetch one image.
    SimProbe,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.as_deref())?;
    if cli.mock {
        cfg.vehicle.mock = true;
    }

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(cfg).await?,
        Command::SimProbe => sim_probe(&cfg).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    anyhow::ensure!(cfg.server.port != 0, "server.port invalid");
    anyhow::ensure!(!cfg.server.api_key.is_empty(), "server.api_key missing");
    if cfg.server.api_key == DEFAULT_API_KEY {
        warn!("doctor: server.api_key is the built-in default; set your own before exposing the gateway");
    }

    fc_doctor::check_vehicle(&cfg.vehicle)?;
    hub_doctor::check_hub(&cfg.hub)?;
    video_doctor::check_video(&cfg.video)?;

    info!("doctor: OK");
    Ok(())
}

fn vehicle_source(cfg: &VehicleConfig) -> (Arc<dyn TelemetrySource>, Arc<dyn VehicleActions>) {
    if cfg.mock {
        info!("vehicle: mock mode");
        let mock = Arc::new(MockSource::new(cfg.sample_period()));
        let source: Arc<dyn TelemetrySource> = mock.clone();
        let actions: Arc<dyn VehicleActions> = mock;
        (source, actions)
    } else {
        let mav = Arc::new(MavSource::new(cfg));
        let source: Arc<dyn TelemetrySource> = mav.clone();
        let actions: Arc<dyn VehicleActions> = mav;
        (source, actions)
    }
}

async fn run(cfg: Config) -> Result<()> {
    let (source, actions) = vehicle_source(&cfg.vehicle);
    let (link, view) = VehicleLink::new(source, cfg.vehicle.backoff());
    let link_task = link.spawn();

    let hub = Arc::new(TelemetryHub::new(view.clone(), cfg.hub.tick()));
    let commander = Commander::new(view, actions);

    let camera = if cfg.video.enable {
        let camera = Arc::new(CameraSource::new(cfg.video.connector(), cfg.video.jpeg_quality));
        // Best effort; the stream endpoint retries on demand.
        let early = Arc::clone(&camera);
        tokio::spawn(async move {
            early.connect().await;
        });
        Some(camera)
    } else {
        info!("video: disabled");
        None
    };

    let app = gateway::router(AppState {
        hub,
        commander,
        camera,
        api_key: Arc::from(cfg.server.api_key.as_str()),
        frame_interval: cfg.video.frame_interval(),
    });

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("bind {}", addr))?;
    info!("gateway: listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("http server")?;

    link_task.abort();
    info!("shutdown complete");
    Ok(())
}

async fn sim_probe(cfg: &Config) -> Result<()> {
    let connector = cfg.video.connector();
    let endpoint = format!("{}:{}", connector.host, connector.port);

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut session = connector.connect().with_context(|| format!("connect simulator rpc {}", endpoint))?;
        println!("connected: {}", endpoint);

        match session.call("ping", vec![]) {
            Ok(v) => println!("ping: {}", v),
            Err(RpcError::Remote(e)) => println!("ping: remote error {}", e),
            Err(e) => return Err(e).context("ping"),
        }

        let camera = Camera::FrontCenter;
        let payload = session
            .call("simGetImage", vec![Value::from(camera.sim_index()), Value::from(0)])
            .context("simGetImage")?;
        match codec::payload_bytes(payload) {
            Some(bytes) => println!("simGetImage {}: {} bytes", camera, bytes.len()),
            None => println!("simGetImage {}: empty or unrecognised payload", camera),
        }
        Ok(())
    })
    .await
    .context("probe worker")?
}
