//! Camera payload node. Pairs with one operator station through the same
//! control handshake as the autopilot and runs capture cycles on
//! IMAGE_START_CAPTURE / IMAGE_STOP_CAPTURE.
//!
//! A cycle takes a frame immediately, then one every `interval` seconds
//! until `count` frames are taken (0 means until stopped). Each frame runs
//! the configured capture command, which writes one JPEG to stdout.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use uas_keys::SharedKey;
use uas_proto::telemetry::{peer_heartbeat, NodeRole};
use uas_proto::{AckResult, CommandName};

use crate::dispatch::{serve, Responder};
use crate::heartbeat;
use crate::session::ControlResponder;
use crate::shutdown::Shutdown;
use crate::transport::{self, SharedTransport};
use crate::CameraConfig;

const RX_POLL: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct CaptureCycle {
    interval: Duration,
    /// `None` runs until stopped.
    remaining: Option<u32>,
    next_at: Instant,
}

/// Capture state driven by the operator's commands.
#[derive(Debug, Default)]
pub struct CameraCommands {
    cycle: Option<CaptureCycle>,
    triggered: u32,
}

impl CameraCommands {
    pub fn is_capturing(&self) -> bool {
        self.cycle.is_some()
    }

    /// Frames triggered since start, across all cycles.
    pub fn triggered(&self) -> u32 {
        self.triggered
    }

    /// The number of the frame to take if one is due at `now`.
    pub fn due(&mut self, now: Instant) -> Option<u32> {
        let c = self.cycle.as_mut()?;
        if now < c.next_at {
            return None;
        }
        c.next_at = now + c.interval;
        let done = match c.remaining.as_mut() {
            Some(r) => {
                *r = r.saturating_sub(1);
                *r == 0
            }
            None => false,
        };
        self.triggered += 1;
        if done {
            info!("camera: capture cycle complete");
            self.cycle = None;
        }
        Some(self.triggered)
    }
}

impl Responder for CameraCommands {
    fn accepts(&self, name: CommandName) -> bool {
        matches!(name, CommandName::ImageStartCapture | CommandName::ImageStopCapture)
    }

    /// START: param2 interval in seconds, param3 frame count. STOP with no
    /// cycle running is denied.
    fn execute(&mut self, name: CommandName, params: &[f64; 7]) -> AckResult {
        match name {
            CommandName::ImageStartCapture => {
                let (interval, count) = (params[1], params[2]);
                let interval_ok = interval.is_finite() && interval >= 0.0;
                let count_ok = count >= 0.0 && count.fract() == 0.0 && count <= f64::from(u32::MAX);
                if !interval_ok || !count_ok {
                    warn!("camera: bad capture request, interval {} count {}", interval, count);
                    return AckResult::Denied;
                }
                if self.cycle.is_some() {
                    info!("camera: replacing running capture cycle");
                }
                info!("camera: capture started, interval {}s count {}", interval, count);
                self.cycle = Some(CaptureCycle {
                    interval: Duration::from_secs_f64(interval),
                    remaining: (count > 0.0).then_some(count as u32),
                    next_at: Instant::now(),
                });
                AckResult::Accepted
            }
            _ => match self.cycle.take() {
                Some(_) => {
                    info!("camera: capture stopped");
                    AckResult::Accepted
                }
                None => {
                    debug!("camera: stop without a running cycle");
                    AckResult::Denied
                }
            },
        }
    }
}

/// What the camera node publishes after every receive iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraStatus {
    pub controller: Option<u8>,
    pub capturing: bool,
    pub triggered: u32,
}

pub struct CameraNode {
    link: SharedTransport,
    status: watch::Receiver<CameraStatus>,
    tasks: Vec<JoinHandle<()>>,
}

impl CameraNode {
    pub fn spawn(link: SharedTransport, key: SharedKey, cfg: CameraConfig, shutdown: Shutdown) -> Result<Self> {
        let (local_id, local_comp) = transport::local_ids(&link)?;
        let (status_tx, status_rx) = watch::channel(CameraStatus::default());

        let rx = RxLoop {
            link: link.clone(),
            local: (local_id, local_comp),
            session: ControlResponder::new(local_id, key),
            camera: CameraCommands::default(),
            status: status_tx,
            cfg: cfg.clone(),
        };
        let tasks = vec![
            tokio::spawn(rx.run(shutdown.clone())),
            tokio::spawn(heartbeat::run(link.clone(), cfg.heartbeat_hz, shutdown, || {
                Some(peer_heartbeat(NodeRole::Camera))
            })),
        ];
        info!("camera: started as {}/{}", local_id, local_comp);
        Ok(Self { link, status: status_rx, tasks })
    }

    pub fn status(&self) -> watch::Receiver<CameraStatus> {
        self.status.clone()
    }

    pub async fn join(self) -> Result<()> {
        for t in self.tasks {
            t.await.context("camera task panicked")?;
        }
        transport::close(&self.link);
        info!("camera: stopped");
        Ok(())
    }
}

struct RxLoop {
    link: SharedTransport,
    local: (u8, u8),
    session: ControlResponder,
    camera: CameraCommands,
    status: watch::Sender<CameraStatus>,
    cfg: CameraConfig,
}

impl RxLoop {
    async fn run(mut self, mut shutdown: Shutdown) {
        let mut tick = tokio::time::interval(RX_POLL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = tick.tick() => {}
            }

            match transport::drain(&self.link) {
                Ok(frames) => {
                    for f in frames {
                        if let Some(reply) = serve(self.local, &mut self.session, &mut self.camera, &f) {
                            if let Err(e) = transport::send(&self.link, &reply) {
                                warn!("camera: send failed: {:#}", e);
                            }
                        }
                    }
                }
                Err(e) => warn!("camera: recv failed: {:#}", e),
            }

            if let Some(timeout) = self.cfg.session_timeout() {
                if self.session.expire(timeout).is_some() && self.camera.is_capturing() {
                    info!("camera: operator gone, capture continues");
                }
            }
            while let Some(n) = self.camera.due(Instant::now()) {
                self.trigger(n);
            }
            self.publish();
        }
        self.session.release();
    }

    fn trigger(&self, n: u32) {
        if self.cfg.capture_cmd.is_empty() {
            debug!("camera: frame {} triggered", n);
            return;
        }
        let (cmd, dir) = (self.cfg.capture_cmd.clone(), self.cfg.output_dir.clone());
        tokio::spawn(async move {
            match capture(&cmd, dir, n).await {
                Ok(path) => info!("camera: frame {} saved to {}", n, path.display()),
                Err(e) => warn!("camera: frame {} failed: {:#}", n, e),
            }
        });
    }

    fn publish(&self) {
        let now = CameraStatus {
            controller: self.session.controller(),
            capturing: self.camera.is_capturing(),
            triggered: self.camera.triggered(),
        };
        self.status.send_if_modified(|s| {
            if *s == now {
                return false;
            }
            *s = now;
            true
        });
    }
}

/// Runs `cmd` and stores its stdout as frame `n` under `dir`.
async fn capture(cmd: &[String], dir: PathBuf, n: u32) -> Result<PathBuf> {
    let (prog, args) = cmd.split_first().context("capture command is empty")?;
    debug!("capture: {}", prog);
    let out = Command::new(prog).args(args).output().await.with_context(|| format!("run {}", prog))?;
    anyhow::ensure!(out.status.success(), "{} failed: {}", prog, out.status);
    anyhow::ensure!(!out.stdout.is_empty(), "{} produced no image", prog);

    tokio::fs::create_dir_all(&dir).await.with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(format!("capture-{:05}.jpg", n));
    tokio::fs::write(&path, &out.stdout).await.with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
