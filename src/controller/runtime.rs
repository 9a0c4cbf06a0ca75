//! # Control loop
//!
//! Owns the meter sampler, the fleet and the dispatch controller, and drives
//! them from three independent cadences:
//! - meter poll (fast): builds the smoothing window, trips the fail-safe
//! - control decision (medium): one [`DispatchController`] cycle
//! - SoC refresh (slow): one read per unit
//!
//! The status surface never touches this state directly. It reads published
//! [`SystemSnapshot`]s and sends [`ControlCommand`]s back over a channel.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::DispatchController;
use super::error::DispatchError;
use super::events::EventLevel;
use super::fleet::Fleet;
use super::status::SystemSnapshot;
use crate::meter::MeterSampler;

const COMMAND_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimings {
    pub meter_poll: Duration,
    pub control: Duration,
    pub soc_refresh: Duration,
}

/// Operator requests; each is answered with the snapshot taken right after it.
#[derive(Debug)]
pub enum ControlCommand {
    Pause(oneshot::Sender<SystemSnapshot>),
    Resume(oneshot::Sender<SystemSnapshot>),
    ResetStatistics(oneshot::Sender<SystemSnapshot>),
}

#[derive(Debug, Error)]
#[error("control loop is not running")]
pub struct LoopClosed;

/// Cloneable handle used by the status surface.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<ControlCommand>,
    snapshots: watch::Receiver<SystemSnapshot>,
}

impl ControllerHandle {
    /// Latest published snapshot.
    pub fn snapshot(&self) -> SystemSnapshot {
        self.snapshots.borrow().clone()
    }

    pub async fn pause(&self) -> Result<SystemSnapshot, LoopClosed> {
        self.request(ControlCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<SystemSnapshot, LoopClosed> {
        self.request(ControlCommand::Resume).await
    }

    pub async fn reset_statistics(&self) -> Result<SystemSnapshot, LoopClosed> {
        self.request(ControlCommand::ResetStatistics).await
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<SystemSnapshot>) -> ControlCommand,
    ) -> Result<SystemSnapshot, LoopClosed> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| LoopClosed)?;
        rx.await.map_err(|_| LoopClosed)
    }
}

pub struct ControlLoop {
    controller: DispatchController,
    meter: MeterSampler,
    fleet: Fleet,
    timings: LoopTimings,
    max_meter_failures: u32,
    enabled: bool,
    meter_tripped: bool,
    fail_safe_stopped: bool,
    commands: mpsc::Receiver<ControlCommand>,
    snapshots: watch::Sender<SystemSnapshot>,
}

impl ControlLoop {
    pub fn new(
        controller: DispatchController,
        meter: MeterSampler,
        fleet: Fleet,
        timings: LoopTimings,
        max_meter_failures: u32,
    ) -> (Self, ControllerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let initial = SystemSnapshot::capture(
            &controller,
            &meter,
            &fleet,
            true,
            false,
            max_meter_failures,
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let control_loop = Self {
            controller,
            meter,
            fleet,
            timings,
            max_meter_failures: max_meter_failures.max(1),
            enabled: true,
            meter_tripped: false,
            fail_safe_stopped: false,
            commands: command_rx,
            snapshots: snapshot_tx,
        };
        let handle = ControllerHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        };
        (control_loop, handle)
    }

    /// Run until `shutdown` fires, then stop the whole fleet.
    ///
    /// Returns the result of that final stop.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), DispatchError> {
        info!(
            units = self.fleet.len(),
            meter = self.meter.kind(),
            meter_poll_ms = self.timings.meter_poll.as_millis() as u64,
            control_ms = self.timings.control.as_millis() as u64,
            soc_refresh_s = self.timings.soc_refresh.as_secs(),
            "control loop starting"
        );

        // Telemetry first, so the first decision has a SoC and a reading
        self.refresh_soc().await;
        self.poll_meter().await;
        self.publish();

        let start = Instant::now();
        let mut meter_tick = interval_at(start + self.timings.meter_poll, self.timings.meter_poll);
        let mut control_tick = interval_at(start + self.timings.control, self.timings.control);
        let mut soc_tick = interval_at(start + self.timings.soc_refresh, self.timings.soc_refresh);
        for tick in [&mut meter_tick, &mut control_tick, &mut soc_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                _ = meter_tick.tick() => self.poll_meter().await,
                _ = soc_tick.tick() => self.refresh_soc().await,
                _ = control_tick.tick() => self.control().await,
            }
            self.publish();
        }

        info!("shutdown requested, stopping fleet");
        let result = self.controller.force_stop(&mut self.fleet, "shutdown").await;
        self.publish();
        result
    }

    async fn poll_meter(&mut self) {
        let reading = self.meter.sample().await;
        let streak = self.meter.consecutive_failures();
        self.controller.note_meter_streak(streak);

        match reading {
            Some(power_w) if self.meter_tripped => {
                self.meter_tripped = false;
                self.fail_safe_stopped = false;
                info!(power_w, "meter recovered, dispatch resumed");
                self.controller
                    .record_event(EventLevel::Info, "Meter recovered, dispatch resumed");
            }
            None if streak >= self.max_meter_failures => {
                if !self.meter_tripped {
                    self.meter_tripped = true;
                    error!(streak, meter = self.meter.kind(), "meter lost, dispatch suspended");
                }
                if !self.fail_safe_stopped {
                    let reason = format!("{} unavailable ({streak} failed polls)", self.meter.kind());
                    // Retried on every poll until the whole fleet accepts it
                    self.fail_safe_stopped = self
                        .controller
                        .force_stop(&mut self.fleet, &reason)
                        .await
                        .is_ok();
                }
            }
            _ => {}
        }
    }

    async fn refresh_soc(&mut self) {
        self.fleet.refresh_soc().await;
        debug!(
            average_soc = ?self.fleet.average_soc(),
            range = ?self.fleet.min_max_soc(),
            "soc refreshed"
        );
    }

    async fn control(&mut self) {
        if !self.enabled {
            debug!("dispatch paused");
            return;
        }
        if self.meter_tripped {
            debug!("dispatch suspended until the meter recovers");
            return;
        }

        let outcome = self
            .controller
            .execute_control_cycle(&mut self.meter, &mut self.fleet)
            .await;
        if outcome.success {
            debug!(status = %outcome.status, "cycle complete");
        } else {
            warn!(status = %outcome.status, "cycle failed");
        }
    }

    async fn handle_command(&mut self, command: ControlCommand) {
        let reply = match command {
            ControlCommand::Pause(reply) => {
                if self.enabled {
                    self.enabled = false;
                    info!("dispatch paused by operator");
                    self.controller
                        .record_event(EventLevel::Warning, "Dispatch paused");
                    let _ = self
                        .controller
                        .force_stop(&mut self.fleet, "paused by operator")
                        .await;
                }
                reply
            }
            ControlCommand::Resume(reply) => {
                if !self.enabled {
                    self.enabled = true;
                    info!("dispatch resumed by operator");
                    self.controller
                        .record_event(EventLevel::Info, "Dispatch resumed");
                }
                reply
            }
            ControlCommand::ResetStatistics(reply) => {
                self.controller.reset_statistics();
                reply
            }
        };
        // The requester may have gone away
        let _ = reply.send(self.snapshot());
    }

    fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot::capture(
            &self.controller,
            &self.meter,
            &self.fleet,
            self.enabled,
            self.meter_tripped,
            self.max_meter_failures,
        )
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}
