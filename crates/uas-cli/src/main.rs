use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use uas_c2::command::CommandOutcome;
use uas_c2::connect::{mode_request, Position};
use uas_c2::mav::MavTransport;
use uas_c2::{doctor as c2_doctor, shutdown, transport, SharedTransport};
use uas_c2::{AutopilotConfig, CameraConfig, CameraNode, Connect, Controller, GcsConfig, LinkConfig};
use uas_keys::{KeyConfig, SharedKey};
use uas_modes::registry::{allowed_custom_modes, allowed_modes, allowed_states, allowed_submode_changes};
use uas_modes::CustomSubmode;

#[derive(Debug, Parser)]
#[command(name = "uas", version, about = "UAS command and control: autopilot node and ground station")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    Keys {
        #[command(subcommand)]
        cmd: KeysCmd,
    },
    /// Run the autopilot node until Ctrl-C.
    Autopilot,
    /// Run the camera payload node until Ctrl-C.
    Camera,
    /// Take control of a node, perform one action, release.
    Gcs {
        #[arg(long)]
        target: u8,
        #[arg(long, default_value_t = 1)]
        target_component: u8,
        #[command(subcommand)]
        action: GcsAction,
    },
    /// Print the mode registry tables.
    Modes,
}

#[derive(Debug, Subcommand)]
enum KeysCmd {
    Init,
    Rotate,
}

#[derive(Debug, Subcommand)]
enum GcsAction {
    Boot,
    SetMode {
        /// Submode name or number, e.g. GROUND_ARMED or 21.
        submode: String,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        custom_mode: Option<String>,
    },
    SetAlt {
        meters: f64,
    },
    SetSpeed {
        knots: f64,
    },
    Reposition {
        #[command(flatten)]
        pos: PosArgs,
        /// Ground speed in m/s, -1 keeps the current speed.
        #[arg(long, default_value_t = -1.0, allow_negative_numbers = true)]
        speed: f64,
        #[arg(long, default_value_t = 0.0)]
        radius: f64,
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        yaw: f64,
    },
    Takeoff {
        #[command(flatten)]
        pos: PosArgs,
    },
    Land {
        #[command(flatten)]
        pos: PosArgs,
    },
    VtolLand {
        #[command(flatten)]
        pos: PosArgs,
    },
    Gimbal {
        #[arg(long, allow_negative_numbers = true)]
        pitch: f64,
        #[arg(long, allow_negative_numbers = true)]
        yaw: f64,
    },
    RoiNone,
    Roi {
        #[command(flatten)]
        pos: PosArgs,
    },
    Rtl,
    Hold,
    Capture {
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        /// 0 captures until stopped.
        #[arg(long, default_value_t = 0)]
        count: u32,
    },
    StopCapture,
    /// Print the target's heartbeats until Ctrl-C or link loss.
    Watch,
}

#[derive(Debug, Args)]
struct PosArgs {
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,
    #[arg(long, allow_negative_numbers = true)]
    lon: f64,
    /// Feet.
    #[arg(long, default_value_t = 0.0)]
    alt: f64,
}

impl From<PosArgs> for Position {
    fn from(p: PosArgs) -> Self {
        Position { lat: p.lat, lon: p.lon, alt_ft: p.alt }
    }
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    link: LinkConfig,
    keys: KeyConfig,
    #[serde(default)]
    autopilot: AutopilotConfig,
    #[serde(default)]
    gcs: GcsConfig,
    #[serde(default)]
    camera: CameraConfig,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let path = path.context("--config is required for this command")?;
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    let cfg: Config = toml::from_str(&s).context("parse config toml")?;
    validate(&cfg).with_context(|| format!("invalid config {}", path))?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<()> {
    c2_doctor::check_link(&cfg.link)?;
    c2_doctor::check_autopilot(&cfg.autopilot)?;
    c2_doctor::check_gcs(&cfg.gcs)?;
    c2_doctor::check_camera(&cfg.camera)?;
    Ok(())
}

fn open_link(cfg: &Config, key: &SharedKey) -> Result<SharedTransport> {
    let signing = cfg.link.signing.then(|| key.signing_key());
    if signing.is_none() {
        warn!("link: signing disabled, unsigned frames are accepted");
    }
    Ok(transport::shared(MavTransport::open(&cfg.link, signing).context("open link")?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Command::Modes = cli.cmd {
        print_modes();
        return Ok(());
    }
    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Keys { cmd } => keys(&cfg, cmd).await?,
        Command::Autopilot => autopilot(&cfg).await?,
        Command::Camera => camera(&cfg).await?,
        Command::Gcs { target, target_component, action } => gcs(&cfg, target, target_component, action).await?,
        Command::Modes => {}
    }
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    uas_keys::doctor::check_keys(&cfg.keys).or_else(|e| {
        warn!("keys missing or weak perms: {:#}", e);
        Ok::<(), anyhow::Error>(())
    })?;

    validate(cfg)?;
    if !cfg.link.signing {
        warn!("link.signing is off");
    }

    info!("doctor: OK");
    Ok(())
}

async fn keys(cfg: &Config, cmd: KeysCmd) -> Result<()> {
    match cmd {
        KeysCmd::Init => {
            SharedKey::init(&cfg.keys)?;
            info!("keys: initialized");
        }
        KeysCmd::Rotate => {
            SharedKey::rotate(&cfg.keys)?;
            info!("keys: rotated");
        }
    }
    Ok(())
}

async fn autopilot(cfg: &Config) -> Result<()> {
    info!("autopilot: starting");
    let key = SharedKey::load(&cfg.keys)?;
    let link = open_link(cfg, &key)?;
    let (stop, sd) = shutdown::channel();
    let ctl = Controller::spawn(link, key, cfg.autopilot.clone(), sd)?;

    // stand-in for the control loop: follow the published flight state
    let mut snapshots = ctl.snapshots();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let s = *snapshots.borrow_and_update();
            info!(
                "autopilot: {} {} {} {}",
                s.custom_submode, s.custom_mode, s.mode, s.state
            );
        }
    });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("autopilot: stopping");
    stop.stop();
    ctl.join().await
}

async fn camera(cfg: &Config) -> Result<()> {
    info!("camera: starting");
    let key = SharedKey::load(&cfg.keys)?;
    let link = open_link(cfg, &key)?;
    let (stop, sd) = shutdown::channel();
    let node = CameraNode::spawn(link, key, cfg.camera.clone(), sd)?;

    let mut status = node.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let s = *status.borrow_and_update();
            info!("camera: controller {:?} capturing {} frames {}", s.controller, s.capturing, s.triggered);
        }
    });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("camera: stopping");
    stop.stop();
    node.join().await
}

async fn gcs(cfg: &Config, target: u8, target_component: u8, action: GcsAction) -> Result<()> {
    let key = SharedKey::load(&cfg.keys)?;
    let link = open_link(cfg, &key)?;
    let (stop, sd) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let conn = Connect::open(link, key, target, target_component, cfg.gcs.clone(), sd).await?;
    let res = run_action(&conn, action).await;
    conn.close()?;

    if let Some(outcome) = res? {
        println!("{:?}", outcome);
        anyhow::ensure!(outcome.is_success(), "command to {} not accepted: {:?}", target, outcome);
    }
    Ok(())
}

async fn run_action(conn: &Connect, action: GcsAction) -> Result<Option<CommandOutcome>> {
    let outcome = match action {
        GcsAction::Boot => conn.boot().await?,
        GcsAction::SetMode { submode, mode, custom_mode } => {
            let req = mode_request(&submode, mode.as_deref(), custom_mode.as_deref())?;
            conn.set_mode(req).await?
        }
        GcsAction::SetAlt { meters } => conn.set_alt(meters).await?,
        GcsAction::SetSpeed { knots } => conn.set_speed(knots).await?,
        GcsAction::Reposition { pos, speed, radius, yaw } => conn.reposition(pos.into(), speed, radius, yaw).await?,
        GcsAction::Takeoff { pos } => conn.takeoff(pos.into()).await?,
        GcsAction::Land { pos } => conn.land(pos.into()).await?,
        GcsAction::VtolLand { pos } => conn.vtol_land(pos.into()).await?,
        GcsAction::Gimbal { pitch, yaw } => conn.gimbal(pitch, yaw).await?,
        GcsAction::RoiNone => conn.roi_none().await?,
        GcsAction::Roi { pos } => conn.roi(pos.into()).await?,
        GcsAction::Rtl => conn.rtl().await?,
        GcsAction::Hold => conn.hold().await?,
        GcsAction::Capture { interval, count } => conn.start_capture(interval, count).await?,
        GcsAction::StopCapture => conn.stop_capture().await?,
        GcsAction::Watch => {
            let end = conn.watch(|p| println!("{}", p.describe())).await?;
            info!("gcs: watch ended: {:?}", end);
            return Ok(None);
        }
    };
    Ok(Some(outcome))
}

fn print_modes() {
    fn list<T: std::fmt::Display>(items: &[T]) -> String {
        items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
    }
    for sub in CustomSubmode::ALL {
        println!("{} ({})", sub, sub.raw());
        println!("  modes:        {}", list(allowed_modes(sub)));
        println!("  custom modes: {}", list(allowed_custom_modes(sub)));
        println!("  states:       {}", list(allowed_states(sub)));
        println!("  next:         {}", list(allowed_submode_changes(sub)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[link]
url = "udpin:0.0.0.0:14550"
system_id = 1

[keys]
key_path = "/tmp/uas.key"
"#;

    fn parse(extra: &str) -> Result<Config> {
        Ok(toml::from_str(&format!("{}{}", BASE, extra))?)
    }

    #[test]
    fn defaults_validate_and_sign() {
        let cfg = parse("").unwrap();
        assert!(cfg.link.signing);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn nan_heartbeat_rate_is_rejected_at_load() {
        for section in ["autopilot", "gcs", "camera"] {
            let cfg = parse(&format!("\n[{}]\nheartbeat_hz = nan\n", section)).unwrap();
            assert!(cfg_heartbeat_is_nan(&cfg, section));
            assert!(validate(&cfg).is_err(), "{} accepted a NaN rate", section);
        }
    }

    fn cfg_heartbeat_is_nan(cfg: &Config, section: &str) -> bool {
        match section {
            "autopilot" => cfg.autopilot.heartbeat_hz.is_nan(),
            "gcs" => cfg.gcs.heartbeat_hz.is_nan(),
            _ => cfg.camera.heartbeat_hz.is_nan(),
        }
    }
}
