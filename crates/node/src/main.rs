mod blink;
mod config;
mod controller;
mod network;
mod ota;
mod publish;
mod sen5x;
mod sensor;
#[cfg(feature = "sim")]
mod sim;
mod state;

#[cfg(not(any(feature = "sim", feature = "sen5x")))]
compile_error!("enable the `sen5x` feature for hardware or `sim` for the simulator");

use anyhow::{Context, Result};
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

use blink::{Blinker, LedPin};
use controller::{CycleController, PollOutcome, LOOP_TICK};
use network::LinkMonitor;
use publish::InfluxPublisher;
use state::StationState;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let cfg = config::load()?;
    tracing::info!(
        influx = %format_args!("{}:{}/{}", cfg.influx.host, cfg.influx.port, cfg.influx.database),
        period_s = cfg.sampling.period_sec,
        "airq-node starting"
    );

    // ── Network ─────────────────────────────────────────────────────
    let link = LinkMonitor::new(&cfg.network.interface, cfg.network.restart);
    link.wait_for_link(cfg.connect_timeout()).await;

    // ── Sensor ──────────────────────────────────────────────────────
    #[cfg(feature = "sen5x")]
    let sensor = sensor::SensorHandle::from_result(
        sen5x::Sen5x::new(cfg.sensor.i2c_address).context("failed to open SEN5x"),
    );

    #[cfg(not(feature = "sen5x"))]
    let sensor = {
        let sim = sim::Sen5xSim::new(sim::Scenario::from_str_lossy(&cfg.sensor.sim_scenario));
        tracing::warn!(scenario = %sim.scenario(), "using simulated sensor");
        sim
    };

    // ── Indicator LED ───────────────────────────────────────────────
    let led = LedPin::new(cfg.indicator.gpio_pin, cfg.indicator.active_low)
        .context("failed to claim indicator LED pin")?;

    // ── Shared state (ephemeral, for the status page) ───────────────
    let shared = StationState::shared(&cfg.network.hostname);
    shared
        .write()
        .await
        .record_system("node started".to_string());

    let publisher = InfluxPublisher::new(
        &cfg.influx.host,
        cfg.influx.port,
        &cfg.influx.database,
        cfg.influx_timeout(),
    );

    let mut controller = CycleController::init(
        sensor,
        publisher,
        link,
        Blinker::new(led),
        cfg.sampling.blink,
        cfg.sample_period(),
        shared.clone(),
    )
    .await;

    // ── Update listener ─────────────────────────────────────────────
    let mut restart_requests = if cfg.ota.enabled {
        ota::start(
            cfg.ota.port,
            shared.clone(),
            cfg.ota.firmware_path.clone(),
            cfg.ota.max_upload_bytes,
        )
        .await
    } else {
        None
    };

    tracing::info!(serial_number = %controller.identity(), "entering main loop");

    // ── Main loop ───────────────────────────────────────────────────
    loop {
        controller
            .service_restart_requests(&mut restart_requests)
            .await;

        match controller.poll(Instant::now()).await {
            PollOutcome::Idle => {}
            PollOutcome::Sampled(report) => tracing::debug!(
                state = ?controller.state(),
                published = report.published,
                skipped = report.skipped.len(),
                "cycle done"
            ),
            PollOutcome::ReadFailed { code } => {
                tracing::debug!(code, "cycle ended without data");
            }
            PollOutcome::Restarted => {
                // Only reached when the restart hook returns.
                tracing::warn!("restart did not take effect");
            }
        }

        sleep(LOOP_TICK).await;
    }
}
