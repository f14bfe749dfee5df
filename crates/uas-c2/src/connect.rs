//! GCS side: take control of one node and drive it with commands.

use anyhow::Result;
use mavlink::common::MavFrame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use uas_keys::SharedKey;
use uas_modes::{CustomMode, CustomSubmode, Mode, ModeRequest, ParseError};
use uas_proto::telemetry::{peer_heartbeat, NodeRole, PeerStatus};
use uas_proto::{AckResult, CommandName, FT_TO_M, KT_TO_MS, LATLON_SCALE};

use crate::command::{CommandOutcome, CommandRequest, CommandSender};
use crate::heartbeat;
use crate::link_state::{observe_all, LinkStatus, SharedLinkStatus};
use crate::session::{ControlInitiator, HandshakeOutcome, SessionState};
use crate::shutdown::Shutdown;
use crate::transport::{self, SharedTransport};
use crate::GcsConfig;

/// Horizontal position in degrees with altitude in feet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub alt_ft: f64,
}

impl Position {
    /// COMMAND_INT x, y, z: lat/lon scaled to 1e-7 degrees, altitude in metres.
    fn wire(&self) -> [f64; 3] {
        [self.lat * LATLON_SCALE, self.lon * LATLON_SCALE, self.alt_ft * FT_TO_M]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    Stopped,
    LinkLost,
}

const POSITION_FRAME: MavFrame = MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT;
const WATCH_POLL: Duration = Duration::from_millis(50);

pub struct Connect {
    link: SharedTransport,
    session: ControlInitiator,
    sender: CommandSender,
    status: SharedLinkStatus,
    cfg: GcsConfig,
    shutdown: Shutdown,
    heartbeat: JoinHandle<()>,
}

impl Connect {
    /// Starts our heartbeat and link tracking for `target`. Control is not
    /// requested until [`Connect::establish`].
    pub fn new(
        link: SharedTransport,
        key: SharedKey,
        target: u8,
        target_component: u8,
        cfg: GcsConfig,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let (local_id, _) = transport::local_ids(&link)?;
        anyhow::ensure!(local_id != target, "gcs and target share system id {}", target);
        let status = LinkStatus::shared(target);
        let inhibit = Arc::new(AtomicBool::new(false));

        let flag = inhibit.clone();
        let heartbeat = tokio::spawn(heartbeat::run(link.clone(), cfg.heartbeat_hz, shutdown.clone(), move || {
            (!flag.load(Ordering::SeqCst)).then(|| peer_heartbeat(NodeRole::Gcs))
        }));

        Ok(Self {
            session: ControlInitiator::new(local_id, target, key),
            sender: CommandSender::new(link.clone(), local_id, target, target_component, inhibit, status.clone()),
            link,
            status,
            cfg,
            shutdown,
            heartbeat,
        })
    }

    /// `new` followed by a successful handshake.
    pub async fn open(
        link: SharedTransport,
        key: SharedKey,
        target: u8,
        target_component: u8,
        cfg: GcsConfig,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let mut c = Self::new(link, key, target, target_component, cfg, shutdown)?;
        match c.establish().await? {
            HandshakeOutcome::Established => Ok(c),
            other => anyhow::bail!("control of {} not established: {:?}", target, other),
        }
    }

    pub async fn establish(&mut self) -> Result<HandshakeOutcome> {
        let mut sd = self.shutdown.clone();
        self.session
            .establish(&self.link, &self.status, self.cfg.handshake_attempts, self.cfg.handshake_period(), &mut sd)
            .await
    }

    pub fn target(&self) -> u8 {
        self.session.target()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Issues `req` as is. Requires an established session.
    pub async fn command(&self, req: CommandRequest) -> Result<CommandOutcome> {
        anyhow::ensure!(
            self.session.state() == SessionState::Established,
            "no control session with {}",
            self.target()
        );
        let mut sd = self.shutdown.clone();
        self.sender.send(&req, &mut sd).await
    }

    fn acked(&self, req: CommandRequest) -> CommandRequest {
        req.with_ack(self.cfg.retry_period(), self.cfg.max_retries)
    }

    pub async fn set_mode(&self, req: ModeRequest) -> Result<CommandOutcome> {
        let params = req.params().map(f64::from);
        self.command(self.acked(CommandRequest::long(CommandName::DoSetMode, &params))).await
    }

    /// UNINIT -> BOOT; the autopilot runs its boot sequence from there.
    ///
    /// A DENIED or missing ack does not mean the node stayed down: when the
    /// first ack is lost the resend reaches a node that has already left
    /// UNINIT and is refused. The next heartbeat settles it, and any custom
    /// mode past UNINIT is reported as [`CommandOutcome::Observed`].
    pub async fn boot(&self) -> Result<CommandOutcome> {
        let outcome = self
            .set_mode(ModeRequest {
                mode: Mode::Preflight,
                custom_mode: CustomMode::Boot,
                custom_submode: CustomSubmode::Boot,
            })
            .await?;
        if !matches!(outcome, CommandOutcome::Failed(AckResult::Denied) | CommandOutcome::TimedOut) {
            return Ok(outcome);
        }
        match self.next_heartbeat().await?.and_then(|p| p.custom_mode) {
            Some(m) if m != CustomMode::Uninit => {
                info!("gcs: {} is already {} after {:?}, boot confirmed", self.target(), m, outcome);
                Ok(CommandOutcome::Observed)
            }
            _ => Ok(outcome),
        }
    }

    /// Waits up to `link_timeout` for a peer heartbeat newer than any seen
    /// so far.
    async fn next_heartbeat(&self) -> Result<Option<PeerStatus>> {
        let seen = self.heartbeats()?;
        let mut sd = self.shutdown.clone();
        let deadline = tokio::time::Instant::now() + self.cfg.link_timeout();
        while tokio::time::Instant::now() < deadline {
            tokio::select! {
                biased;
                _ = sd.wait() => return Ok(None),
                _ = tokio::time::sleep(WATCH_POLL) => {}
            }
            if let Err(e) = self.poll() {
                warn!("gcs: recv failed: {:#}", e);
            }
            if self.heartbeats()? > seen {
                return Ok(self.peer());
            }
        }
        Ok(None)
    }

    fn heartbeats(&self) -> Result<u64> {
        self.status
            .lock()
            .map(|st| st.heartbeats)
            .map_err(|_| anyhow::anyhow!("link status lock poisoned"))
    }

    pub async fn set_alt(&self, alt_m: f64) -> Result<CommandOutcome> {
        let frame = MavFrame::MAV_FRAME_GLOBAL_TERRAIN_ALT as u32 as f64;
        self.command(CommandRequest::long(CommandName::DoChangeAltitude, &[alt_m, frame])).await
    }

    pub async fn set_speed(&self, knots: f64) -> Result<CommandOutcome> {
        // speed type 0 (airspeed), throttle unchanged
        self.command(CommandRequest::long(CommandName::DoChangeSpeed, &[0.0, knots * KT_TO_MS, -1.0])).await
    }

    pub async fn reposition(&self, pos: Position, speed_ms: f64, radius_m: f64, yaw_deg: f64) -> Result<CommandOutcome> {
        let [x, y, z] = pos.wire();
        let params = [speed_ms, 0.0, radius_m, yaw_deg, x, y, z];
        self.command(CommandRequest::int(CommandName::DoReposition, POSITION_FRAME, &params)).await
    }

    pub async fn takeoff(&self, pos: Position) -> Result<CommandOutcome> {
        self.positional(CommandName::NavVtolTakeoff, pos).await
    }

    pub async fn land(&self, pos: Position) -> Result<CommandOutcome> {
        self.positional(CommandName::NavLand, pos).await
    }

    pub async fn vtol_land(&self, pos: Position) -> Result<CommandOutcome> {
        self.positional(CommandName::NavVtolLand, pos).await
    }

    pub async fn roi(&self, pos: Position) -> Result<CommandOutcome> {
        self.positional(CommandName::DoSetRoiLocation, pos).await
    }

    async fn positional(&self, name: CommandName, pos: Position) -> Result<CommandOutcome> {
        let [x, y, z] = pos.wire();
        self.command(CommandRequest::int(name, POSITION_FRAME, &[0.0, 0.0, 0.0, 0.0, x, y, z])).await
    }

    pub async fn roi_none(&self) -> Result<CommandOutcome> {
        self.command(CommandRequest::long(CommandName::DoSetRoiNone, &[])).await
    }

    /// Rates are NaN: only the angles are set.
    pub async fn gimbal(&self, pitch_deg: f64, yaw_deg: f64) -> Result<CommandOutcome> {
        let params = [pitch_deg, yaw_deg, f64::NAN, f64::NAN];
        self.command(CommandRequest::long(CommandName::DoGimbalManagerPitchyaw, &params)).await
    }

    pub async fn rtl(&self) -> Result<CommandOutcome> {
        self.command(self.acked(CommandRequest::long(CommandName::NavReturnToLaunch, &[]))).await
    }

    pub async fn hold(&self) -> Result<CommandOutcome> {
        self.command(self.acked(CommandRequest::long(CommandName::NavLoiterUnlim, &[]))).await
    }

    pub async fn start_capture(&self, interval_s: f64, count: u32) -> Result<CommandOutcome> {
        let req = CommandRequest::long(CommandName::ImageStartCapture, &[0.0, interval_s, count as f64]);
        self.command(self.acked(req)).await
    }

    pub async fn stop_capture(&self) -> Result<CommandOutcome> {
        self.command(self.acked(CommandRequest::long(CommandName::ImageStopCapture, &[]))).await
    }

    /// Drains the link into the peer status. Returns the number of frames.
    pub fn poll(&self) -> Result<usize> {
        let frames = transport::drain(&self.link)?;
        observe_all(&self.status, &frames);
        Ok(frames.len())
    }

    pub fn peer(&self) -> Option<PeerStatus> {
        self.status.lock().ok().and_then(|st| st.peer.clone())
    }

    pub fn link_alive(&self) -> bool {
        let timeout = self.cfg.link_timeout();
        self.status.lock().map(|st| st.is_alive(timeout)).unwrap_or(false)
    }

    /// Calls `on_beat` for every new peer heartbeat until stopped or until
    /// the peer has been silent for `link_timeout`.
    pub async fn watch<F: FnMut(&PeerStatus)>(&self, mut on_beat: F) -> Result<WatchEnd> {
        let mut sd = self.shutdown.clone();
        let mut seen = 0;
        let mut silent_since = tokio::time::Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = sd.wait() => return Ok(WatchEnd::Stopped),
                _ = tokio::time::sleep(WATCH_POLL) => {}
            }
            if let Err(e) = self.poll() {
                warn!("gcs: recv failed: {:#}", e);
            }
            let count = self.heartbeats()?;
            if count != seen {
                seen = count;
                silent_since = tokio::time::Instant::now();
                if let Some(p) = self.peer() {
                    on_beat(&p);
                }
            } else if silent_since.elapsed() > self.cfg.link_timeout() {
                warn!("gcs: no heartbeat from {} for {:?}", self.target(), self.cfg.link_timeout());
                return Ok(WatchEnd::LinkLost);
            }
        }
    }

    /// Releases control (request=1) and stops our heartbeat.
    pub fn close(mut self) -> Result<()> {
        self.heartbeat.abort();
        let res = self.session.release(&self.link);
        info!("gcs: closed link to {}", self.target());
        res
    }
}

impl Drop for Connect {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// Builds a DO_SET_MODE request from names or numbers. Mode and custom mode
/// default to the submode's registry defaults.
pub fn mode_request(submode: &str, mode: Option<&str>, custom_mode: Option<&str>) -> Result<ModeRequest, ParseError> {
    let mut req = ModeRequest::for_submode(submode.parse::<CustomSubmode>()?);
    if let Some(m) = mode {
        req.mode = m.parse::<Mode>()?;
    }
    if let Some(c) = custom_mode {
        req.custom_mode = c.parse::<CustomMode>()?;
    }
    Ok(req)
}
