//! Short-lived device sessions.
//!
//! Every gateway command opens one session, performs exactly one operation and
//! closes it. [`DeviceConnector`] is the seam: [`TuyaConnector`] speaks the
//! Tuya LAN protocol over TCP, tests plug in fakes.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::protocol::{
    CommandType, HEADER_LEN_55AA, HEADER_LEN_6699, PREFIX_55AA, PREFIX_6699, TuyaMessage, Version,
    pack_message, parse_header, unpack_message,
};
use crate::registry::{RegistryEntry, unix_now};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::future::BoxFuture;
use hmac::{Hmac, Mac};
use log::{debug, info};
use md5::{Digest, Md5};
use rand::RngCore;
use serde_json::{Value, json};
use sha2::Sha256;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEVICE_PORT: u16 = 6668;

const NO_PROTOCOL_HEADER_CMDS: &[u32] = &[
    CommandType::DpQuery as u32,
    CommandType::DpQueryNew as u32,
    CommandType::UpdateDps as u32,
    CommandType::HeartBeat as u32,
    CommandType::SessKeyNegStart as u32,
    CommandType::SessKeyNegResp as u32,
    CommandType::SessKeyNegFinish as u32,
];
/// Version string, 12 reserved bytes.
const VERSION_HEADER_LEN: usize = 15;
/// "3.1" + 16 hex chars of MD5 in front of a signed v3.1 payload.
const V31_SIGNATURE_LEN: usize = 19;
const MAX_PREFIX_SCAN: usize = 1024;
const MAX_FRAME_LEN: usize = 64 * 1024;
/// Frames read while waiting for a status reply before giving up.
const MAX_STATUS_FRAMES: usize = 8;

type HmacSha256 = Hmac<Sha256>;

/// Addressing and credentials for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTarget {
    pub id: String,
    pub ip: String,
    pub key: String,
    pub version: Version,
}

impl DeviceTarget {
    pub fn from_entry(entry: &RegistryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            ip: entry.ip.clone(),
            key: entry.key.clone(),
            version: entry.version.unwrap_or_default(),
        }
    }
}

/// An open connection to one device.
pub trait DeviceSession: Send {
    /// Current data point values, as reported by the device.
    fn status(&mut self) -> BoxFuture<'_, Result<Value>>;

    /// Write one data point. Returns the device reply, if one was awaited.
    fn set_value(&mut self, dp: String, value: Value) -> BoxFuture<'_, Result<Option<Value>>>;

    fn turn_on(&mut self, switch: String) -> BoxFuture<'_, Result<Option<Value>>> {
        self.set_value(switch, Value::Bool(true))
    }

    fn turn_off(&mut self, switch: String) -> BoxFuture<'_, Result<Option<Value>>> {
        self.set_value(switch, Value::Bool(false))
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

pub trait DeviceConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        target: &'a DeviceTarget,
    ) -> BoxFuture<'a, Result<Box<dyn DeviceSession>>>;
}

/// A single device operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOp {
    Status,
    SetValue { dp: String, value: Value },
    TurnOn { switch: String },
    TurnOff { switch: String },
}

/// Open a session, run `op`, and close the session whatever the outcome.
pub async fn perform(
    connector: &dyn DeviceConnector,
    target: &DeviceTarget,
    op: DeviceOp,
) -> Result<Option<Value>> {
    let mut session = connector.connect(target).await?;
    let result = match op {
        DeviceOp::Status => session.status().await.map(Some),
        DeviceOp::SetValue { dp, value } => session.set_value(dp, value).await,
        DeviceOp::TurnOn { switch } => session.turn_on(switch).await,
        DeviceOp::TurnOff { switch } => session.turn_off(switch).await,
    };
    session.close().await;
    result
}

/// Opens TCP sessions to real devices.
#[derive(Debug, Clone)]
pub struct TuyaConnector {
    port: u16,
    timeout: Duration,
}

impl TuyaConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            port: DEVICE_PORT,
            timeout,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl DeviceConnector for TuyaConnector {
    fn connect<'a>(
        &'a self,
        target: &'a DeviceTarget,
    ) -> BoxFuture<'a, Result<Box<dyn DeviceSession>>> {
        Box::pin(async move {
            let session = TuyaSession::connect(target, self.port, self.timeout).await?;
            Ok(Box::new(session) as Box<dyn DeviceSession>)
        })
    }
}

/// Tuya LAN protocol session over any byte stream.
pub struct TuyaSession<S = TcpStream> {
    id: String,
    local_key: Vec<u8>,
    version: Version,
    stream: S,
    seqno: u32,
    session_key: Option<Vec<u8>>,
    timeout: Duration,
}

impl TuyaSession<TcpStream> {
    pub async fn connect(target: &DeviceTarget, port: u16, io_timeout: Duration) -> Result<Self> {
        info!("Connecting to device {} at {}:{}", target.id, target.ip, port);
        let stream = timeout(io_timeout, TcpStream::connect((target.ip.as_str(), port))).await??;
        Self::establish(stream, target, io_timeout).await
    }
}

impl<S> TuyaSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an open stream, negotiating a session key on v3.4 and later.
    /// An unknown version is treated as 3.3.
    pub async fn establish(stream: S, target: &DeviceTarget, io_timeout: Duration) -> Result<Self> {
        if target.key.len() != 16 {
            return Err(TuyaError::KeyOrVersionError);
        }
        let version = match target.version {
            Version::Auto => Version::V3_3,
            v => v,
        };
        let mut session = Self {
            id: target.id.clone(),
            local_key: target.key.as_bytes().to_vec(),
            version,
            stream,
            seqno: 1,
            session_key: None,
            timeout: io_timeout,
        };
        if version.val() >= 3.4 {
            session.negotiate_session_key().await?;
        }
        Ok(session)
    }

    pub async fn query_status(&mut self) -> Result<Value> {
        let (cmd, payload) = self.command_payload(CommandType::DpQuery, None);
        self.send(cmd, serde_json::to_vec(&payload)?).await?;

        for _ in 0..MAX_STATUS_FRAMES {
            let msg = self.read_frame().await?;
            if msg.payload.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Value>(&msg.payload) {
                Ok(v) => {
                    if let Some(status) = normalize_status(v) {
                        return Ok(status);
                    }
                }
                Err(e) => debug!("Ignoring non-JSON frame from {}: {}", self.id, e),
            }
        }
        Err(TuyaError::InvalidPayload)
    }

    /// Send a control command without waiting for the device's reply.
    pub async fn send_dps(&mut self, dps: Value) -> Result<()> {
        let (cmd, payload) = self.command_payload(CommandType::Control, Some(dps));
        self.send(cmd, serde_json::to_vec(&payload)?).await
    }

    fn cipher_key(&self) -> &[u8] {
        self.session_key.as_deref().unwrap_or(&self.local_key)
    }

    fn command_payload(&self, command: CommandType, dps: Option<Value>) -> (CommandType, Value) {
        let v = self.version.val();
        let cmd = if v >= 3.4 {
            match command {
                CommandType::Control => CommandType::ControlNew,
                CommandType::DpQuery => CommandType::DpQueryNew,
                other => other,
            }
        } else {
            command
        };

        let t = unix_now();
        if cmd == CommandType::ControlNew {
            let dps = dps.unwrap_or_else(|| json!({}));
            return (cmd, json!({"protocol": 5, "t": t, "data": {"dps": dps}}));
        }

        let mut payload = json!({
            "gwId": self.id,
            "devId": self.id,
            "uid": self.id,
            "t": t.to_string(),
        });
        if let Some(dps) = dps {
            payload["dps"] = dps;
        }
        (cmd, payload)
    }

    async fn send(&mut self, cmd: CommandType, payload: Vec<u8>) -> Result<()> {
        let msg = TuyaMessage {
            seqno: self.seqno,
            cmd: cmd as u32,
            payload,
            prefix: if self.version.val() >= 3.5 {
                PREFIX_6699
            } else {
                PREFIX_55AA
            },
            ..Default::default()
        };
        self.seqno += 1;
        debug!(
            "Sending cmd=0x{:02X} seqno={} to {}",
            msg.cmd, msg.seqno, self.id
        );

        let packed = self.pack_msg(msg)?;
        timeout(self.timeout, self.stream.write_all(&packed)).await??;
        Ok(())
    }

    fn pack_msg(&self, mut msg: TuyaMessage) -> Result<Vec<u8>> {
        let v = self.version.val();
        let key = self.cipher_key().to_vec();
        let cipher = TuyaCipher::new(&key)?;
        let use_header = !NO_PROTOCOL_HEADER_CMDS.contains(&msg.cmd);

        if v >= 3.4 {
            if use_header {
                msg.payload = self.add_protocol_header(&msg.payload);
            }
            if v < 3.5 {
                msg.payload = cipher.encrypt_ecb(&msg.payload, true)?;
            }
        } else if v >= 3.2 {
            msg.payload = cipher.encrypt_ecb(&msg.payload, true)?;
            if use_header {
                msg.payload = self.add_protocol_header(&msg.payload);
            }
        } else if msg.cmd == CommandType::Control as u32 {
            msg.payload = self.sign_v31(&cipher, &msg.payload)?;
        }

        let hmac_key = (v >= 3.4).then_some(key.as_slice());
        pack_message(&msg, hmac_key)
    }

    fn add_protocol_header(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = self.version.as_bytes().to_vec();
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(payload);
        out
    }

    /// v3.1 control: base64 ciphertext prefixed by the version and the middle
    /// of an MD5 over the payload and local key.
    fn sign_v31(&self, cipher: &TuyaCipher, payload: &[u8]) -> Result<Vec<u8>> {
        let encoded = STANDARD.encode(cipher.encrypt_ecb(payload, true)?);
        let mut md5 = Md5::new();
        md5.update(b"data=");
        md5.update(encoded.as_bytes());
        md5.update(b"||lpv=");
        md5.update(self.version.as_bytes());
        md5.update(b"||");
        md5.update(&self.local_key);
        let digest = hex::encode(md5.finalize());

        let mut out = self.version.as_bytes().to_vec();
        out.extend_from_slice(digest[8..24].as_bytes());
        out.extend_from_slice(encoded.as_bytes());
        Ok(out)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match timeout(self.timeout, self.stream.read_exact(buf)).await? {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TuyaError::Offline),
            Err(e) => Err(e.into()),
        }
    }

    /// Read, verify and decrypt the next frame.
    async fn read_frame(&mut self) -> Result<TuyaMessage> {
        let mut head = [0u8; 4];
        self.read_exact(&mut head).await?;
        let mut scanned = 0;
        while !matches!(u32::from_be_bytes(head), PREFIX_55AA | PREFIX_6699) {
            if scanned >= MAX_PREFIX_SCAN {
                return Err(TuyaError::InvalidHeader);
            }
            let mut byte = [0u8; 1];
            self.read_exact(&mut byte).await?;
            head.rotate_left(1);
            head[3] = byte[0];
            scanned += 1;
        }

        let prefix = u32::from_be_bytes(head);
        let header_len = if prefix == PREFIX_6699 {
            HEADER_LEN_6699
        } else {
            HEADER_LEN_55AA
        };
        let mut packet = head.to_vec();
        packet.resize(header_len, 0);
        self.read_exact(&mut packet[4..]).await?;

        let header = parse_header(&packet)?;
        if header.total_length > MAX_FRAME_LEN || header.total_length < header_len {
            return Err(TuyaError::DecodeError(format!(
                "Frame length {} out of range",
                header.total_length
            )));
        }
        packet.resize(header.total_length, 0);
        self.read_exact(&mut packet[header_len..]).await?;

        let key = self.cipher_key().to_vec();
        let frame_key = (prefix == PREFIX_6699 || self.version.val() >= 3.4).then_some(key.as_slice());
        let mut msg = unpack_message(&packet, frame_key, Some(false))?;
        if let Some(rc) = msg.retcode.filter(|rc| *rc != 0) {
            debug!("Device {} returned code {}", self.id, rc);
        }
        if !msg.payload.is_empty() {
            msg.payload = self.clean_payload(std::mem::take(&mut msg.payload), msg.prefix)?;
        }
        Ok(msg)
    }

    fn has_version_header(&self, payload: &[u8]) -> bool {
        payload.len() >= VERSION_HEADER_LEN && payload[..3] == *self.version.as_bytes()
    }

    fn clean_payload(&self, mut payload: Vec<u8>, prefix: u32) -> Result<Vec<u8>> {
        let v = self.version.val();
        let cipher = TuyaCipher::new(self.cipher_key())?;

        if v >= 3.4 {
            if prefix == PREFIX_55AA {
                payload = cipher.decrypt_ecb(&payload)?;
            }
            if self.has_version_header(&payload) {
                payload.drain(..VERSION_HEADER_LEN);
            }
        } else if v >= 3.2 {
            if self.has_version_header(&payload) {
                payload.drain(..VERSION_HEADER_LEN);
            }
            if !payload.is_empty() {
                match cipher.decrypt_ecb(&payload) {
                    Ok(mut plain) => {
                        if self.has_version_header(&plain) {
                            plain.drain(..VERSION_HEADER_LEN);
                        }
                        payload = plain;
                    }
                    Err(e) if payload.first() != Some(&b'{') => return Err(e),
                    Err(_) => {}
                }
            }
        } else if payload.starts_with(self.version.as_bytes()) && payload.len() > V31_SIGNATURE_LEN
        {
            let raw = STANDARD
                .decode(&payload[V31_SIGNATURE_LEN..])
                .map_err(|e| TuyaError::DecodeError(e.to_string()))?;
            payload = cipher.decrypt_ecb(&raw)?;
        }
        Ok(payload)
    }

    async fn negotiate_session_key(&mut self) -> Result<()> {
        debug!("Starting session key negotiation with {}", self.id);
        let mut local_nonce = [0u8; 16];
        rand::rng().fill_bytes(&mut local_nonce);

        self.send(CommandType::SessKeyNegStart, local_nonce.to_vec())
            .await?;
        let resp = match self.read_frame().await {
            Err(TuyaError::Offline) => return Err(TuyaError::KeyOrVersionError),
            other => other?,
        };
        if resp.cmd != CommandType::SessKeyNegResp as u32 || resp.payload.len() < 48 {
            return Err(TuyaError::KeyOrVersionError);
        }

        let remote_nonce = &resp.payload[..16];
        let remote_hmac = &resp.payload[16..48];

        let mut mac = HmacSha256::new_from_slice(&self.local_key)
            .map_err(|_| TuyaError::EncryptionFailed)?;
        mac.update(&local_nonce);
        mac.verify_slice(remote_hmac)
            .map_err(|_| TuyaError::KeyOrVersionError)?;

        let mut mac = HmacSha256::new_from_slice(&self.local_key)
            .map_err(|_| TuyaError::EncryptionFailed)?;
        mac.update(remote_nonce);
        let finish = mac.finalize().into_bytes().to_vec();
        self.send(CommandType::SessKeyNegFinish, finish).await?;

        let mixed: Vec<u8> = local_nonce
            .iter()
            .zip(remote_nonce)
            .map(|(a, b)| a ^ b)
            .collect();
        let cipher = TuyaCipher::new(&self.local_key)?;
        let session_key = if self.version.val() >= 3.5 {
            cipher.encrypt_gcm(&mixed, &local_nonce[..12], &[])?[12..28].to_vec()
        } else {
            cipher.encrypt_ecb(&mixed, false)?
        };
        self.session_key = Some(session_key);
        debug!("Session key negotiated with {}", self.id);
        Ok(())
    }
}

/// Status replies from v3.4+ nest the data points under `data`.
fn normalize_status(mut v: Value) -> Option<Value> {
    if v.get("dps").is_some() {
        return Some(v);
    }
    let dps = v.get("data").and_then(|d| d.get("dps")).cloned()?;
    v["dps"] = dps;
    Some(v)
}

impl<S> DeviceSession for TuyaSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn status(&mut self) -> BoxFuture<'_, Result<Value>> {
        Box::pin(self.query_status())
    }

    fn set_value(&mut self, dp: String, value: Value) -> BoxFuture<'_, Result<Option<Value>>> {
        Box::pin(async move {
            let mut dps = serde_json::Map::new();
            dps.insert(dp, value);
            self.send_dps(Value::Object(dps)).await?;
            Ok(None)
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut this = *self;
            if let Err(e) = this.stream.shutdown().await {
                debug!("Closing session with {}: {}", this.id, e);
            }
        })
    }
}
