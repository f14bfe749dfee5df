//! Autopilot node: receive, transmit and heartbeat loops around one flight
//! state machine.
//!
//! The receive loop is the only owner of the [`FlightStateMachine`]. It
//! publishes a [`FlightSnapshot`] through a `watch` channel after every
//! iteration; the heartbeat loop and the external control loop only ever see
//! those snapshots. Replies are queued to the transmit loop.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use uas_keys::SharedKey;
use uas_modes::{CustomSubmode, FlightSnapshot, FlightStateMachine};
use uas_proto::telemetry::vehicle_heartbeat;
use uas_proto::Packet;

use crate::dispatch::serve;
use crate::heartbeat;
use crate::session::ControlResponder;
use crate::shutdown::Shutdown;
use crate::transport::{self, Inbound, SharedTransport};
use crate::AutopilotConfig;

const RX_POLL: Duration = Duration::from_millis(5);
const OUTBOUND_QUEUE: usize = 64;

pub struct Controller {
    link: SharedTransport,
    snapshots: watch::Receiver<FlightSnapshot>,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    pub fn spawn(link: SharedTransport, key: SharedKey, cfg: AutopilotConfig, shutdown: Shutdown) -> Result<Self> {
        let (local_id, local_comp) = transport::local_ids(&link)?;
        let (snap_tx, snap_rx) = watch::channel(FlightSnapshot::default());
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let rx = RxLoop {
            link: link.clone(),
            local: (local_id, local_comp),
            fsm: FlightStateMachine::new(),
            session: ControlResponder::new(local_id, key),
            snapshots: snap_tx,
            outbound: out_tx,
            cfg: cfg.clone(),
        };

        let hb_snapshots = snap_rx.clone();
        let tasks = vec![
            tokio::spawn(rx.run(shutdown.clone())),
            tokio::spawn(tx_loop(link.clone(), out_rx, cfg.tx_hz, shutdown.clone())),
            tokio::spawn(heartbeat::run(link.clone(), cfg.heartbeat_hz, shutdown, move || {
                Some(vehicle_heartbeat(&hb_snapshots.borrow()))
            })),
        ];
        info!("controller: started as system {}", local_id);

        Ok(Self { link, snapshots: snap_rx, tasks })
    }

    /// Read-only view of the flight state for the control loop.
    pub fn snapshots(&self) -> watch::Receiver<FlightSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> FlightSnapshot {
        *self.snapshots.borrow()
    }

    /// Waits for all loops to finish after a stop, then closes the link.
    pub async fn join(self) -> Result<()> {
        for t in self.tasks {
            t.await.context("controller task panicked")?;
        }
        transport::close(&self.link);
        info!("controller: stopped");
        Ok(())
    }
}

struct RxLoop {
    link: SharedTransport,
    local: (u8, u8),
    fsm: FlightStateMachine,
    session: ControlResponder,
    snapshots: watch::Sender<FlightSnapshot>,
    outbound: mpsc::Sender<Packet>,
    cfg: AutopilotConfig,
}

impl RxLoop {
    async fn run(mut self, mut shutdown: Shutdown) {
        if !self.cfg.wait_for_boot {
            self.boot_sequence();
        }
        self.publish();

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
                        self.handle(f);
                    }
                }
                Err(e) => warn!("controller: recv failed: {:#}", e),
            }

            if let Some(timeout) = self.cfg.session_timeout() {
                self.session.expire(timeout);
            }
            if self.fsm.take_boot_request() {
                self.boot_sequence();
            }
            self.publish();
        }

        if let Some(id) = self.session.release() {
            info!("controller: released session held by {} on stop", id);
        }
    }

    fn handle(&mut self, f: Inbound) {
        if let Some(reply) = serve(self.local, &mut self.session, &mut self.fsm, &f) {
            self.queue(reply);
        }
    }

    fn queue(&self, msg: Packet) {
        if let Err(e) = self.outbound.try_send(msg) {
            warn!("controller: outbound queue: {}", e);
        }
    }

    /// Steps up from the current submode until `boot_target`. Bounded by the
    /// number of submodes.
    fn boot_sequence(&mut self) {
        let target = self.cfg.boot_target;
        info!("controller: boot sequence {} -> {}", self.fsm.custom_submode(), target);
        for _ in 0..CustomSubmode::ALL.len() {
            if self.fsm.custom_submode() == target {
                return;
            }
            self.fsm.inc_mode();
        }
        if self.fsm.custom_submode() != target {
            warn!("controller: boot sequence stopped at {}, {} not reached", self.fsm.custom_submode(), target);
        }
    }

    fn publish(&self) {
        let snap = self.fsm.snapshot();
        self.snapshots.send_if_modified(|s| {
            if *s == snap {
                return false;
            }
            *s = snap;
            true
        });
    }
}

async fn tx_loop(link: SharedTransport, mut queue: mpsc::Receiver<Packet>, hz: f64, mut shutdown: Shutdown) {
    let mut tick = tokio::time::interval(heartbeat::period(hz));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        let stopping = tokio::select! {
            biased;
            _ = shutdown.wait() => true,
            _ = tick.tick() => false,
        };
        while let Ok(msg) = queue.try_recv() {
            if let Err(e) = transport::send(&link, &msg) {
                warn!("controller: send failed: {:#}", e);
            }
        }
        if stopping {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::shutdown;
    use crate::transport::Transport;
    use mavlink::common::{MavMessage, MavState, CHANGE_OPERATOR_CONTROL_DATA};
    use uas_modes::{ModeRequest, State};
    use uas_proto::CommandName;

    fn cfg() -> AutopilotConfig {
        AutopilotConfig { heartbeat_hz: 100.0, tx_hz: 200.0, ..AutopilotConfig::default() }
    }

    fn take(key: &SharedKey) -> Packet {
        Packet::Mav(MavMessage::CHANGE_OPERATOR_CONTROL(CHANGE_OPERATOR_CONTROL_DATA {
            target_system: 3,
            control_request: 0,
            version: 0,
            passkey: key.passkey(),
        }))
    }

    #[tokio::test]
    async fn boots_immediately_when_not_waiting() {
        let bus = LoopbackBus::default();
        let key = SharedKey::new("k").unwrap();
        let (stop, sd) = shutdown::channel();
        let c = Controller::spawn(
            transport::shared(bus.port(3, 1)),
            key,
            AutopilotConfig { wait_for_boot: false, ..cfg() },
            sd,
        )
        .unwrap();

        let mut rx = c.snapshots();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.custom_submode == CustomSubmode::GroundDisarmed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.snapshot().state, State::Standby);

        stop.stop();
        c.join().await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_reflects_state_and_commands_need_a_session() {
        let bus = LoopbackBus::default();
        let key = SharedKey::new("k").unwrap();
        let mut gcs = bus.port(250, 190);
        let (stop, sd) = shutdown::channel();
        let c = Controller::spawn(transport::shared(bus.port(3, 1)), key.clone(), cfg(), sd).unwrap();

        // no session yet: the command is ignored
        let boot = ModeRequest::for_submode(CustomSubmode::Boot).params().map(f64::from);
        let cmd = Packet::Mav(crate::command::CommandRequest::long(CommandName::DoSetMode, &boot).encode(3, 1));
        gcs.send(&cmd).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(c.snapshot().custom_submode, CustomSubmode::Uninit);

        gcs.send(&take(&key)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        gcs.send(&cmd).unwrap();

        let mut rx = c.snapshots();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.custom_submode == CustomSubmode::GroundDisarmed))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut saw_ack = false;
        let mut last_hb = None;
        while let Some(f) = gcs.try_recv().unwrap() {
            match f.msg {
                Packet::Ack(a) => {
                    assert_eq!(a.target_system, 250);
                    assert_eq!(a.target_component, 190);
                    saw_ack = true;
                }
                Packet::Mav(MavMessage::HEARTBEAT(hb)) => last_hb = Some(hb),
                _ => {}
            }
        }
        assert!(saw_ack);
        assert_eq!(last_hb.map(|hb| hb.system_status), Some(MavState::MAV_STATE_STANDBY));

        stop.stop();
        c.join().await.unwrap();
    }
}
