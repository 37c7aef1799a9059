use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use crossbeam::channel::Sender;
use serde_json::Value;

use crate::{
    llm::worker::{spawn_pool, Worker},
    sys::memory::MemoryRegistry,
};
use packet::{Reassembler, ReassemblerOptions};
use router::{Engine, EngineOptions, UdpLink};

pub mod conversation;
pub mod npc;
pub mod packet;
pub mod parser;
pub mod router;

const TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ServerOptions {
    #[serde(default)]
    pub listen: String,
    #[serde(default)]
    pub game: String,
    #[serde(default)]
    pub max_packet_size: usize,
    #[serde(default)]
    pub fragment_timeout_secs: u64,
    #[serde(default)]
    pub max_pending_messages: usize,
    #[serde(default)]
    pub max_pending_bytes: usize,
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub idle_action: String,
}

impl ServerOptions {
    pub fn fill_default_value(&mut self) {
        if self.listen.is_empty() {
            self.listen = "0.0.0.0:8199".to_string();
        }
        if self.game.is_empty() {
            self.game = "127.0.0.1:8084".to_string();
        }
        if self.max_packet_size == 0 {
            self.max_packet_size = 6000;
        }
        if self.fragment_timeout_secs == 0 {
            self.fragment_timeout_secs = 30;
        }
        if self.max_pending_messages == 0 {
            self.max_pending_messages = 1024;
        }
        if self.max_pending_bytes == 0 {
            self.max_pending_bytes = 64 * 1024 * 1024;
        }
        if self.workers == 0 {
            self.workers = 4;
        }
        if self.idle_action.is_empty() {
            self.idle_action = "idle".to_string();
        }
    }

    fn reassembler(&self) -> ReassemblerOptions {
        ReassemblerOptions {
            timeout: Duration::from_secs(self.fragment_timeout_secs),
            max_pending: self.max_pending_messages,
            max_pending_bytes: self.max_pending_bytes,
            ..Default::default()
        }
    }
}

pub struct App {
    pub server: ServerOptions,
    pub engine: EngineOptions,
    pub worker: Worker,
    pub memory: MemoryRegistry,
}

impl App {
    pub fn run_loop(self) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(&self.server.listen)?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        let game: SocketAddr = self.server.game.parse()?;
        log::info!("listening on {}, game at {game}", socket.local_addr()?);

        let (inbound_tx, inbound_rx) = crossbeam::channel::unbounded();
        let reader = socket.try_clone()?;
        let reassembler = Reassembler::new(self.server.reassembler());
        std::thread::Builder::new()
            .name("udp-recv".to_string())
            .spawn(move || listen(reader, reassembler, inbound_tx))?;

        let (job_tx, job_rx) = crossbeam::channel::bounded(self.server.workers * 16);
        let (reply_tx, reply_rx) = crossbeam::channel::unbounded();
        spawn_pool(self.server.workers, self.worker, job_rx, reply_tx)?;

        let link = UdpLink {
            socket,
            game,
            max_packet_size: self.server.max_packet_size,
        };
        let mut engine = Engine::new(self.engine, self.memory, job_tx, Box::new(link));
        let ticker = crossbeam::channel::tick(TICK);

        loop {
            crossbeam::select! {
                recv(inbound_rx) -> message => {
                    let Ok(message) = message else {
                        anyhow::bail!("udp receiver stopped");
                    };
                    engine.dispatch(message);
                }
                recv(reply_rx) -> reply => {
                    let Ok(reply) = reply else {
                        anyhow::bail!("all workers stopped");
                    };
                    engine.on_reply(reply);
                }
                recv(ticker) -> now => {
                    if let Ok(now) = now {
                        engine.tick(now);
                    }
                }
            }
        }
    }
}

/// Reads datagrams until the engine goes away, forwarding every complete
/// message that parses as JSON.
fn listen(socket: UdpSocket, mut reassembler: Reassembler, tx: Sender<Value>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                reassembler.purge(Instant::now());
                continue;
            }
            Err(e) => {
                log::warn!("udp receive failed: {e}");
                continue;
            }
        };

        let Some(payload) = reassembler.ingest(&buf[..n]) else {
            continue;
        };
        match serde_json::from_slice::<Value>(&payload) {
            Ok(message) => {
                if tx.send(message).is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("dropping non-json message from {from}: {e}"),
        }
    }
    log::debug!("udp receiver exiting");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::component::packet::split_message;

    #[test]
    fn defaults_fill_empty_fields() {
        let mut options: ServerOptions = toml::from_str("workers = 2").unwrap();
        options.fill_default_value();
        assert_eq!(options.workers, 2);
        assert_eq!(options.listen, "0.0.0.0:8199");
        assert_eq!(options.max_packet_size, 6000);
        assert_eq!(options.reassembler().timeout, Duration::from_secs(30));
        assert_eq!(options.reassembler().max_pending_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn listener_reassembles_fragmented_json() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = crossbeam::channel::unbounded();
        std::thread::spawn(move || listen(server, Reassembler::new(Default::default()), tx));

        let message = json!({"func": "wake_up", "npc_name": "李大爷", "note": "x".repeat(300)});
        let payload = message.to_string().into_bytes();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"not json at all", addr).unwrap();
        for packet in split_message("m1", &payload, 100).into_iter().rev() {
            client.send_to(&packet, addr).unwrap();
        }

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, message);
    }
}
