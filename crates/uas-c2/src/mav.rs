use anyhow::{anyhow, bail, Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use uas_proto::frame::{FrameReader, MAX_FRAME_LEN};
use uas_proto::{Packet, SigningKey};

use crate::framing::Framing;
use crate::transport::{Inbound, Transport};
use crate::LinkConfig;

/// Lets the reader thread notice a close between reads.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Where a link goes, parsed from its connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Listen on a UDP port; replies go to whoever spoke last.
    UdpIn(String),
    UdpOut(String),
    UdpBcast(String),
    /// Accepts one TCP client.
    TcpIn(String),
    TcpOut(String),
    Serial { device: String, baud: u32 },
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url.split_once(':').with_context(|| format!("link url {:?} has no scheme", url))?;
        if scheme == "serial" {
            let (dev, baud) = rest.rsplit_once(':').context("serial url must be serial:<dev>:<baud>")?;
            anyhow::ensure!(!dev.is_empty(), "serial url has no device");
            let baud: u32 = baud.parse().with_context(|| format!("bad baud rate {:?}", baud))?;
            anyhow::ensure!(baud > 0, "baud rate must be positive");
            return Ok(Endpoint::Serial { device: dev.to_string(), baud });
        }

        let (host, port) = rest.rsplit_once(':').with_context(|| format!("link url {:?} needs host:port", url))?;
        anyhow::ensure!(!host.is_empty(), "link url {:?} has no host", url);
        port.parse::<u16>().with_context(|| format!("bad port {:?}", port))?;
        let addr = rest.to_string();
        Ok(match scheme {
            "udpin" => Endpoint::UdpIn(addr),
            "udpout" => Endpoint::UdpOut(addr),
            "udpbcast" => Endpoint::UdpBcast(addr),
            "tcpin" => Endpoint::TcpIn(addr),
            "tcpout" => Endpoint::TcpOut(addr),
            other => bail!("unknown link scheme {:?}", other),
        })
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("resolve {}", addr))?
        .next()
        .ok_or_else(|| anyhow!("{} resolves to nothing", addr))
}

type LastPeer = Arc<Mutex<Option<SocketAddr>>>;

enum Writer {
    /// udpin: answer the most recent sender.
    UdpReply { sock: UdpSocket, peer: LastPeer },
    UdpTo { sock: UdpSocket, to: SocketAddr },
    Stream(Box<dyn Write + Send>),
}

impl Writer {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Writer::UdpReply { sock, peer } => {
                let to = *peer.lock().map_err(|_| anyhow!("peer lock poisoned"))?;
                match to {
                    Some(to) => {
                        sock.send_to(bytes, to).context("udp send")?;
                    }
                    None => debug!("mav: nobody has spoken yet, frame dropped"),
                }
            }
            Writer::UdpTo { sock, to } => {
                sock.send_to(bytes, *to).context("udp send")?;
            }
            Writer::Stream(w) => w.write_all(bytes).context("stream write")?,
        }
        Ok(())
    }
}

enum Source {
    Udp { sock: UdpSocket, peer: Option<LastPeer> },
    Stream(Box<dyn Read + Send>),
}

fn read_loop(mut src: Source, tx: mpsc::Sender<Vec<u8>>, closed: Arc<AtomicBool>) {
    let mut reader = FrameReader::new();
    let mut buf = [0u8; MAX_FRAME_LEN * 4];
    while !closed.load(Ordering::Relaxed) {
        let n = match &mut src {
            Source::Udp { sock, peer } => sock.recv_from(&mut buf).map(|(n, from)| {
                if let Some(Ok(mut last)) = peer.as_ref().map(|p| p.lock()) {
                    *last = Some(from);
                }
                n
            }),
            Source::Stream(r) => r.read(&mut buf),
        };
        match n {
            Ok(0) if matches!(src, Source::Stream(_)) => {
                warn!("mav: stream closed by peer");
                break;
            }
            Ok(n) => reader.push(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                debug!("mav: read error: {}", e);
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        }
        while let Some(frame) = reader.next_frame() {
            if tx.send(frame).is_err() {
                return;
            }
        }
    }
}

/// MAVLink 2 link over UDP, TCP or a serial port.
///
/// Reads block, so a dedicated reader thread splits the byte stream into
/// frames and `try_recv` only drains its channel.
pub struct MavTransport {
    framing: Framing,
    writer: Writer,
    rx: mpsc::Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
    url: String,
}

impl MavTransport {
    /// With `signing` set, frames are signed and unsigned ones are dropped.
    pub fn open(cfg: &LinkConfig, signing: Option<SigningKey>) -> Result<Self> {
        let (writer, source) = match Endpoint::parse(&cfg.url)? {
            Endpoint::UdpIn(addr) => {
                let sock = UdpSocket::bind(resolve(&addr)?).with_context(|| format!("bind udp {}", addr))?;
                let peer: LastPeer = Arc::new(Mutex::new(None));
                let rx = sock.try_clone().context("clone udp socket")?;
                (
                    Writer::UdpReply { sock, peer: peer.clone() },
                    Source::Udp { sock: rx, peer: Some(peer) },
                )
            }
            Endpoint::UdpOut(addr) => udp_sender(&addr, false)?,
            Endpoint::UdpBcast(addr) => udp_sender(&addr, true)?,
            Endpoint::TcpIn(addr) => {
                let listener = TcpListener::bind(resolve(&addr)?).with_context(|| format!("listen tcp {}", addr))?;
                info!("mav: waiting for a tcp client on {}", addr);
                let (stream, from) = listener.accept().context("accept tcp client")?;
                info!("mav: tcp client {}", from);
                stream_halves(stream)?
            }
            Endpoint::TcpOut(addr) => {
                let stream = TcpStream::connect(resolve(&addr)?).with_context(|| format!("connect tcp {}", addr))?;
                stream_halves(stream)?
            }
            Endpoint::Serial { device, baud } => {
                let port = tokio_serial::new(device.as_str(), baud)
                    .timeout(READ_TIMEOUT)
                    .open()
                    .with_context(|| format!("open serial device {}", device))?;
                let rx = port.try_clone().with_context(|| format!("clone serial device {}", device))?;
                (Writer::Stream(Box::new(port)), Source::Stream(Box::new(rx)))
            }
        };
        if let Source::Udp { sock, .. } = &source {
            sock.set_read_timeout(Some(READ_TIMEOUT)).context("udp read timeout")?;
        }

        let (tx, rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        std::thread::Builder::new()
            .name("mav-rx".into())
            .spawn(move || read_loop(source, tx, flag))
            .context("spawn mav reader thread")?;

        let framing = Framing::new(cfg.system_id, cfg.component_id, signing);
        info!(
            "mav: connected {} as {}/{} ({})",
            cfg.url,
            cfg.system_id,
            cfg.component_id,
            if framing.is_signed() { "signed" } else { "unsigned" }
        );
        Ok(Self { framing, writer, rx, closed, url: cfg.url.clone() })
    }
}

fn udp_sender(addr: &str, broadcast: bool) -> Result<(Writer, Source)> {
    let to = resolve(addr)?;
    let sock = UdpSocket::bind("0.0.0.0:0").context("bind udp")?;
    if broadcast {
        sock.set_broadcast(true).context("enable udp broadcast")?;
    }
    let rx = sock.try_clone().context("clone udp socket")?;
    Ok((Writer::UdpTo { sock, to }, Source::Udp { sock: rx, peer: None }))
}

fn stream_halves(stream: TcpStream) -> Result<(Writer, Source)> {
    stream.set_read_timeout(Some(READ_TIMEOUT)).context("tcp read timeout")?;
    stream.set_nodelay(true).context("tcp nodelay")?;
    let rx = stream.try_clone().context("clone tcp stream")?;
    Ok((Writer::Stream(Box::new(stream)), Source::Stream(Box::new(rx))))
}

impl Transport for MavTransport {
    fn system_id(&self) -> u8 {
        self.framing.system_id()
    }

    fn component_id(&self) -> u8 {
        self.framing.component_id()
    }

    fn send(&mut self, msg: &Packet) -> Result<()> {
        let bytes = self.framing.encode(msg);
        self.writer.write(&bytes).with_context(|| format!("send {} on {}", msg.name(), self.url))
    }

    fn try_recv(&mut self) -> Result<Option<Inbound>> {
        loop {
            match self.rx.try_recv() {
                Ok(bytes) => {
                    if let Some(m) = self.framing.accept(&bytes) {
                        return Ok(Some(m));
                    }
                }
                Err(mpsc::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::TryRecvError::Disconnected) => bail!("mav reader for {} stopped", self.url),
            }
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl Drop for MavTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::MavMessage;
    use std::time::Instant;
    use uas_proto::telemetry::{peer_heartbeat, NodeRole};

    #[test]
    fn parses_link_urls() {
        assert_eq!(
            Endpoint::parse("serial:/dev/ttyUSB0:57600").unwrap(),
            Endpoint::Serial { device: "/dev/ttyUSB0".into(), baud: 57600 }
        );
        assert_eq!(Endpoint::parse("udpin:0.0.0.0:14550").unwrap(), Endpoint::UdpIn("0.0.0.0:14550".into()));
        assert_eq!(Endpoint::parse("tcpout:127.0.0.1:5760").unwrap(), Endpoint::TcpOut("127.0.0.1:5760".into()));
        assert!(Endpoint::parse("serial:/dev/ttyUSB0").is_err());
        assert!(Endpoint::parse("serial::57600").is_err());
        assert!(Endpoint::parse("serial:/dev/ttyS0:fast").is_err());
        assert!(Endpoint::parse("udpin:14550").is_err());
        assert!(Endpoint::parse("udpout:host:99999").is_err());
        assert!(Endpoint::parse("http://x:1").is_err());
    }

    fn link(url: String, system_id: u8) -> LinkConfig {
        LinkConfig { url, system_id, component_id: 1, signing: true }
    }

    fn recv_within(t: &mut MavTransport, limit: Duration) -> Option<Inbound> {
        let start = Instant::now();
        while start.elapsed() < limit {
            if let Some(m) = t.try_recv().unwrap() {
                return Some(m);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn udp_pair_exchanges_signed_frames() {
        let port = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let key = SigningKey::from_bytes([3; 32]);
        let mut server = MavTransport::open(&link(format!("udpin:127.0.0.1:{}", port), 3), Some(key.clone())).unwrap();
        let mut client = MavTransport::open(&link(format!("udpout:127.0.0.1:{}", port), 250), Some(key)).unwrap();

        let hb = Packet::Mav(MavMessage::HEARTBEAT(peer_heartbeat(NodeRole::Gcs)));
        client.send(&hb).unwrap();
        let got = recv_within(&mut server, Duration::from_secs(2)).expect("server hears client");
        assert_eq!(got.source(), 250);

        // udpin answers whoever spoke last
        server.send(&hb).unwrap();
        let back = recv_within(&mut client, Duration::from_secs(2)).expect("client hears reply");
        assert_eq!(back.source(), 3);
    }
}
