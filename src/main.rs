use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zero_feed_controller::{
    api,
    config::Config,
    controller::{ControlLoop, DispatchController},
    hardware::{DeviceFactory, Devices},
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal
    let _ = dotenvy::dotenv();

    let cfg = Config::load().context("loading configuration")?;
    let _log_guard = telemetry::init_tracing(&cfg.logging);

    let Devices { meter, fleet } = DeviceFactory::new(&cfg)
        .build()
        .context("building devices")?;

    let controller = DispatchController::new(cfg.dispatch_settings());
    let (control_loop, handle) = ControlLoop::new(
        controller,
        meter,
        fleet,
        cfg.loop_timings(),
        cfg.meter.max_failures_before_stop,
    );

    let shutdown = CancellationToken::new();
    let loop_task = tokio::spawn(control_loop.run(shutdown.clone()));

    let addr = cfg.server.socket_addr()?;
    if cfg.server.host == "0.0.0.0" {
        warn!("status API bound to all interfaces and has no authentication");
    }
    info!(%addr, "starting zero-feed controller");

    let app = api::router(handle, &cfg.server);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    // The loop stops the fleet on the signal itself, not after the server drains
    telemetry::cancel_on(telemetry::shutdown_signal(), shutdown.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    // Also covers a server that failed on its own
    shutdown.cancel();
    match loop_task.await {
        Ok(Ok(())) => info!("fleet stopped"),
        Ok(Err(e)) => error!(error = %e, "final fleet stop failed"),
        Err(e) => error!(error = %e, "control loop task failed"),
    }

    served.context("serving status API")?;
    warn!("shutdown complete");
    Ok(())
}
