//! UDP transport for the OSC control channel.
//!
//! Each bridged entity owns an [`OscEndpoint`]: its path prefix, the URL it can be
//! reached at and the peer it sends to. An endpoint is always replaced whole, so
//! readers on other threads never observe a half-updated address.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::Notify;

use crate::error::{PluginError, Result};
use crate::protocol::{decode_datagram, BridgeMessage};

const URL_SCHEME: &str = "osc.udp://";
const MAX_DATAGRAM: usize = 64 * 1024;

/// Splits `osc.udp://host:port/path` into its socket address and path.
pub fn parse_url(url: &str) -> Result<(SocketAddr, String)> {
    let rest = url
        .strip_prefix(URL_SCHEME)
        .ok_or_else(|| PluginError::Protocol(format!("not an osc.udp url: '{url}'")))?;
    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };
    let addr = authority
        .to_socket_addrs()
        .map_err(|e| PluginError::Protocol(format!("bad address in '{url}': {e}")))?
        .next()
        .ok_or_else(|| PluginError::Protocol(format!("'{url}' resolves to nothing")))?;
    Ok((addr, path.trim_end_matches('/').to_string()))
}

pub fn make_url(addr: SocketAddr, path: &str) -> String {
    let addr = if addr.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    } else {
        addr
    };
    format!("{URL_SCHEME}{addr}{path}")
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointData {
    /// Prefix this entity's messages are addressed with.
    pub path: String,
    /// URL the peer uses to reach this entity.
    pub source: String,
    pub target_url: String,
    pub target: Option<SocketAddr>,
}

#[derive(Default)]
pub struct OscEndpoint {
    data: ArcSwap<EndpointData>,
}

impl OscEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the endpoint with a new path and source. The target is dropped.
    pub fn set(&self, path: impl Into<String>, source: impl Into<String>) {
        self.data.store(Arc::new(EndpointData {
            path: path.into(),
            source: source.into(),
            ..Default::default()
        }));
    }

    /// Points the endpoint at the peer behind `url`, keeping path and source.
    pub fn set_target(&self, url: &str) -> Result<()> {
        let (addr, _) = parse_url(url)?;
        let current = self.data.load();
        self.data.store(Arc::new(EndpointData {
            path: current.path.clone(),
            source: current.source.clone(),
            target_url: url.to_string(),
            target: Some(addr),
        }));
        Ok(())
    }

    pub fn clear_target(&self) {
        let current = self.data.load();
        self.data.store(Arc::new(EndpointData {
            path: current.path.clone(),
            source: current.source.clone(),
            ..Default::default()
        }));
    }

    /// Resets path, source and target. Clearing an empty endpoint is a no-op.
    pub fn clear(&self) {
        self.data.store(Arc::new(EndpointData::default()));
    }

    pub fn is_cleared(&self) -> bool {
        *self.data.load_full() == EndpointData::default()
    }

    pub fn snapshot(&self) -> Arc<EndpointData> {
        self.data.load_full()
    }

    pub fn path(&self) -> String {
        self.data.load().path.clone()
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.data.load().target
    }

    pub fn has_target(&self) -> bool {
        self.target().is_some()
    }
}

/// Sending half of a bound OSC socket.
#[derive(Clone)]
pub struct OscSender {
    socket: Arc<UdpSocket>,
}

impl OscSender {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    /// An unbound-port sender for peers that never receive.
    pub fn ephemeral() -> Result<Self> {
        Ok(Self::new(UdpSocket::bind("127.0.0.1:0")?))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn send(&self, target: SocketAddr, prefix: &str, msg: &BridgeMessage) -> Result<()> {
        let bytes = msg.encode(prefix)?;
        self.socket.send_to(&bytes, target)?;
        tracing::debug!("osc -> {target} {prefix}/{}", msg.method());
        Ok(())
    }

    /// Sends under the endpoint's own path. Returns false when it has no target.
    pub fn send_to(&self, endpoint: &OscEndpoint, msg: &BridgeMessage) -> Result<bool> {
        let data = endpoint.snapshot();
        match data.target {
            Some(target) => {
                self.send(target, &data.path, msg)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Fixed-capacity FIFO shared between a producer and the idle thread.
pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

pub const BRIDGE_QUEUE_SIZE: usize = 256;

impl<T> MessageQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Returns false when full; the item is dropped.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        true
    }

    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Endpoint plus outgoing queue of one bridge process (plugin or UI).
pub struct BridgeChannel {
    pub endpoint: OscEndpoint,
    pub queue: MessageQueue<BridgeMessage>,
}

impl Default for BridgeChannel {
    fn default() -> Self {
        Self {
            endpoint: OscEndpoint::new(),
            queue: MessageQueue::new(BRIDGE_QUEUE_SIZE),
        }
    }
}

impl BridgeChannel {
    pub fn push(&self, msg: BridgeMessage) {
        if !self.queue.push(msg) {
            tracing::warn!("bridge queue full, dropping message");
        }
    }

    /// Sends everything queued once the peer is known. Returns the number sent.
    pub fn flush(&self, sender: &OscSender) -> usize {
        if !self.endpoint.has_target() {
            return 0;
        }
        let mut sent = 0;
        for msg in self.queue.drain() {
            match sender.send_to(&self.endpoint, &msg) {
                Ok(true) => sent += 1,
                Ok(false) => break,
                Err(e) => tracing::warn!("bridge send failed: {e}"),
            }
        }
        sent
    }

    pub fn clear(&self) {
        self.queue.clear();
        self.endpoint.clear();
    }
}

/// `(prefix, sender address, message)` for every decoded datagram.
pub type MessageHandler = Box<dyn FnMut(&str, SocketAddr, BridgeMessage) + Send>;

/// Receive loop on a dedicated `plinth-osc` thread.
pub struct OscServer {
    local_addr: SocketAddr,
    sender: OscSender,
    shutdown: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

impl OscServer {
    pub fn bind(addr: &str, mut handler: MessageHandler) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let sender = OscSender::new(socket.try_clone()?);
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);

        let thread = std::thread::Builder::new()
            .name("plinth-osc".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("osc runtime failed to start: {e}");
                        return;
                    }
                };
                runtime.block_on(async move {
                    let socket = match tokio::net::UdpSocket::from_std(socket) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::error!("osc socket unusable: {e}");
                            return;
                        }
                    };
                    let mut buf = vec![0u8; MAX_DATAGRAM];
                    loop {
                        tokio::select! {
                            _ = stop.notified() => break,
                            received = socket.recv_from(&mut buf) => match received {
                                Ok((len, from)) => match decode_datagram(&buf[..len]) {
                                    Ok(messages) => {
                                        for (prefix, msg) in messages {
                                            tracing::debug!("osc <- {from} {prefix}/{}", msg.method());
                                            handler(&prefix, from, msg);
                                        }
                                    }
                                    Err(e) => tracing::warn!("dropping datagram from {from}: {e}"),
                                },
                                Err(e) => tracing::warn!("osc receive failed: {e}"),
                            },
                        }
                    }
                });
            })?;

        tracing::info!("osc server listening on {local_addr}");
        Ok(Self {
            local_addr,
            sender,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self, path: &str) -> String {
        make_url(self.local_addr, path)
    }

    pub fn sender(&self) -> OscSender {
        self.sender.clone()
    }

    pub fn shutdown(&mut self) {
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for OscServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_url() {
        let (addr, path) = parse_url("osc.udp://127.0.0.1:9000/plinth/2").unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(path, "/plinth/2");

        let (_, path) = parse_url("osc.udp://127.0.0.1:9000/").unwrap();
        assert_eq!(path, "");

        assert!(parse_url("http://127.0.0.1:9000/x").is_err());
        assert!(parse_url("osc.udp://nowhere/x").is_err());
    }

    #[test]
    fn test_make_url_replaces_unspecified_host() {
        let url = make_url("0.0.0.0:4444".parse().unwrap(), "/plinth");
        assert_eq!(url, "osc.udp://127.0.0.1:4444/plinth");
    }

    #[test]
    fn test_endpoint_rebuild_and_clear() {
        let ep = OscEndpoint::new();
        assert!(ep.is_cleared());

        ep.set("/plinth/1", "osc.udp://127.0.0.1:1000/plinth/1");
        ep.set_target("osc.udp://127.0.0.1:2000/ui").unwrap();
        assert_eq!(ep.target(), Some("127.0.0.1:2000".parse().unwrap()));
        assert_eq!(ep.path(), "/plinth/1");

        ep.set("/plinth/5", "");
        assert!(!ep.has_target());

        ep.clear();
        assert!(ep.is_cleared());
        ep.clear();
        assert!(ep.is_cleared());
    }

    #[test]
    fn test_bad_target_keeps_endpoint() {
        let ep = OscEndpoint::new();
        ep.set("/plinth/1", "");
        assert!(ep.set_target("garbage").is_err());
        assert_eq!(ep.path(), "/plinth/1");
        assert!(!ep.has_target());
    }

    #[test]
    fn test_queue_capacity() {
        let queue = MessageQueue::new(2);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_channel_holds_messages_until_target() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let sender = OscSender::ephemeral().unwrap();

        let channel = BridgeChannel::default();
        channel.endpoint.set("/plinth/0", "");
        channel.push(BridgeMessage::Program(3));
        assert_eq!(channel.flush(&sender), 0);
        assert_eq!(channel.queue.len(), 1);

        let url = make_url(receiver.local_addr().unwrap(), "/bridge");
        channel.endpoint.set_target(&url).unwrap();
        assert_eq!(channel.flush(&sender), 1);

        let mut buf = [0u8; 1024];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        let decoded = decode_datagram(&buf[..len]).unwrap();
        assert_eq!(decoded[0], ("/plinth/0".to_string(), BridgeMessage::Program(3)));
    }

    #[test]
    fn test_server_dispatches_and_stops() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut server = OscServer::bind(
            "127.0.0.1:0",
            Box::new(move |prefix, _, msg| {
                let _ = tx.send((prefix.to_string(), msg));
            }),
        )
        .unwrap();

        let client = OscSender::ephemeral().unwrap();
        client
            .send(server.local_addr(), "/plinth/7", &BridgeMessage::Show)
            .unwrap();

        let (prefix, msg) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(prefix, "/plinth/7");
        assert_eq!(msg, BridgeMessage::Show);

        server.shutdown();
        server.shutdown();
    }
}
