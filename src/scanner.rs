//! Passive UDP discovery.
//!
//! Tuya devices announce themselves by broadcast on 6666 (v3.1 plain), 6667
//! (v3.3/v3.4 ECB) and 7000 (v3.5 GCM). Each port gets its own listener task
//! that feeds the [`Registry`].

use crate::crypto::{TuyaCipher, udp_key};
use crate::error::Result;
use crate::protocol::{PREFIX_6699, Version, unpack_message};
use crate::registry::{Announcement, Registry};
use crate::store::CredentialStore;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const DEFAULT_PORTS: [u16; 3] = [6666, 6667, 7000];

/// Header plus return code in front of a 55AA announcement payload.
const FRAME_HEAD: usize = 20;
/// CRC plus suffix behind it.
const FRAME_TAIL: usize = 8;
const RECV_BUFFER: usize = 4096;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Decode one datagram. Never fails: a packet that cannot be understood
/// becomes an announcement carrying only the sender's address.
pub fn decode_announcement(data: &[u8], from_ip: &str) -> Announcement {
    let fields = decode_payload(data)
        .and_then(|payload| serde_json::from_slice::<Value>(&payload).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        });

    match fields.and_then(|f| announcement_from_fields(f, from_ip)) {
        Some(ann) => ann,
        None => {
            debug!("Unreadable announcement from {}", from_ip);
            let mut fields = Map::new();
            fields.insert("ip".into(), Value::String(from_ip.to_string()));
            Announcement {
                id: String::new(),
                ip: from_ip.to_string(),
                version: None,
                fields,
            }
        }
    }
}

fn decode_payload(data: &[u8]) -> Option<Vec<u8>> {
    if data.first() == Some(&b'{') {
        return Some(data.to_vec());
    }

    let key = udp_key();
    if data.len() >= 4 && BigEndian::read_u32(&data[..4]) == PREFIX_6699 {
        return match unpack_message(data, Some(key), None) {
            Ok(msg) => Some(msg.payload),
            Err(e) => {
                debug!("6699 announcement rejected: {}", e);
                None
            }
        };
    }

    let inner = if data.len() > FRAME_HEAD + FRAME_TAIL {
        &data[FRAME_HEAD..data.len() - FRAME_TAIL]
    } else {
        &[][..]
    };
    let cipher = TuyaCipher::new(key).ok()?;
    if let Ok(plain) = cipher.decrypt_ecb(inner) {
        return Some(plain);
    }
    // v3.4 frames carry an HMAC trailer instead of a CRC
    if let Ok(msg) = unpack_message(data, Some(key), None)
        && let Ok(plain) = cipher.decrypt_ecb(&msg.payload)
    {
        return Some(plain);
    }
    // v3.1 announcements are not encrypted
    Some(inner.to_vec())
}

fn announcement_from_fields(fields: Map<String, Value>, from_ip: &str) -> Option<Announcement> {
    let id = fields
        .get("gwId")
        .or_else(|| fields.get("devId"))
        .or_else(|| fields.get("id"))
        .and_then(|v| v.as_str())?
        .to_string();
    let ip = fields
        .get("ip")
        .and_then(|v| v.as_str())
        .unwrap_or(from_ip)
        .to_string();
    let version = fields
        .get("version")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Version>().ok());

    Some(Announcement {
        id,
        ip,
        version,
        fields,
    })
}

/// Receives announcements and records them in the registry.
pub struct DiscoveryListener {
    registry: Arc<Registry>,
    store: Arc<CredentialStore>,
    bind_addr: String,
    retry_budget: u32,
}

impl DiscoveryListener {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<CredentialStore>,
        bind_addr: impl Into<String>,
        retry_budget: u32,
    ) -> Self {
        Self {
            registry,
            store,
            bind_addr: bind_addr.into(),
            retry_budget,
        }
    }

    /// Process one datagram. Returns true if it introduced a new device.
    pub fn handle_packet(&self, data: &[u8], from: SocketAddr) -> bool {
        let ann = decode_announcement(data, &from.ip().to_string());
        let credentials = if ann.id.is_empty() {
            None
        } else {
            self.store.lookup(&ann.id)
        };

        let is_new = self
            .registry
            .observe(&ann, credentials.as_ref(), self.retry_budget);
        if is_new {
            match &credentials {
                Some(c) => info!("Discovered {} ({}) at {}", ann.id, c.name, ann.ip),
                None => info!("Discovered unknown device {} at {}", ann.id, ann.ip),
            }
        }
        is_new
    }

    /// Create and configure a UDP socket for a given port.
    pub fn create_socket(&self, port: u16) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        debug!("Creating UDP socket for port {}...", port);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address on port {}: {}", port, e);
        }

        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast on port {}: {}", port, e);
        }

        match socket.bind(&SockAddr::from(addr)) {
            Ok(_) => debug!("Successfully bound to {}", addr),
            Err(e) => {
                error!("Failed to bind to {}: {}", addr, e);
                return Err(e.into());
            }
        }

        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Receive on `socket` until `token` is cancelled.
    pub async fn listen(&self, socket: UdpSocket, token: CancellationToken) {
        let port = socket.local_addr().map(|a| a.port()).unwrap_or_default();
        info!("Listening for Tuya devices on UDP {}", port);
        let mut buf = vec![0u8; RECV_BUFFER];

        while !token.is_cancelled() {
            tokio::select! {
                _ = token.cancelled() => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok((len, addr)) => {
                        self.handle_packet(&buf[..len], addr);
                    }
                    Err(e) => {
                        warn!("UDP receive on {} failed: {}", port, e);
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                }
            }
        }
        debug!("UDP listener on {} stopped", port);
    }

    /// Bind every port and spawn one listener task per socket. Ports that fail
    /// to bind are logged and skipped; returns how many listeners started.
    pub fn spawn(
        self: &Arc<Self>,
        ports: &[u16],
        tracker: &TaskTracker,
        token: &CancellationToken,
    ) -> usize {
        let mut started = 0;
        for &port in ports {
            match self.create_socket(port) {
                Ok(socket) => {
                    let this = self.clone();
                    let token = token.clone();
                    tracker.spawn(async move { this.listen(socket, token).await });
                    started += 1;
                }
                Err(e) => error!("UDP listener on port {} not started: {}", port, e),
            }
        }
        if started == 0 {
            warn!("No UDP discovery listener could be started");
        }
        started
    }
}
