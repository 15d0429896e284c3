//! Tuya wire framing.
//! Handles the 55AA (CRC32 or HMAC-SHA256 trailer) and 6699 (AES-GCM) frame
//! formats shared by TCP sessions and UDP announcements.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const PREFIX_6699: u32 = 0x00006699;
pub const SUFFIX_55AA: u32 = 0x0000AA55;
pub const SUFFIX_6699: u32 = 0x00009966;

pub const HEADER_LEN_55AA: usize = 16;
pub const HEADER_LEN_6699: usize = 18;
const SUFFIX_LEN: usize = 4;
const CRC_LEN: usize = 4;
const HMAC_LEN: usize = 32;
const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const RETCODE_LEN: usize = 4;

type HmacSha256 = Hmac<Sha256>;

define_command_type! {
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    ControlNew = 0x0d,
    DpQueryNew = 0x10,
    UpdateDps = 0x12,
    UdpNew = 0x13,
    BroadcastLpv34 = 0x23,
    ReqDevInfo = 0x25,
}

define_version! {
    V3_1 = ("3.1", 3.1),
    V3_2 = ("3.2", 3.2),
    V3_3 = ("3.3", 3.3),
    V3_4 = ("3.4", 3.4),
    V3_5 = ("3.5", 3.5),
}

/// One decoded (or to-be-encoded) Tuya frame.
#[derive(Debug, Clone)]
pub struct TuyaMessage {
    pub seqno: u32,
    pub cmd: u32,
    pub retcode: Option<u32>,
    /// JSON or encrypted bytes, without framing
    pub payload: Vec<u8>,
    pub prefix: u32,
    /// GCM IV, 6699 frames only
    pub iv: Option<Vec<u8>>,
}

impl Default for TuyaMessage {
    fn default() -> Self {
        Self {
            seqno: 0,
            cmd: 0,
            retcode: None,
            payload: Vec::new(),
            prefix: PREFIX_55AA,
            iv: None,
        }
    }
}

/// Fixed-size part of a frame.
#[derive(Debug, Clone)]
pub struct TuyaHeader {
    pub prefix: u32,
    pub seqno: u32,
    pub cmd: u32,
    /// Length field as sent: everything after the header, suffix included for 55AA
    pub payload_len: u32,
    /// Total frame length in bytes
    pub total_length: usize,
}

impl TuyaHeader {
    pub fn header_len(&self) -> usize {
        if self.prefix == PREFIX_6699 {
            HEADER_LEN_6699
        } else {
            HEADER_LEN_55AA
        }
    }
}

/// Parse the header at the start of `data`.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < HEADER_LEN_55AA {
        return Err(TuyaError::DecodeError("Header too short".into()));
    }

    match BigEndian::read_u32(&data[0..4]) {
        PREFIX_55AA => {
            let payload_len = BigEndian::read_u32(&data[12..16]);
            Ok(TuyaHeader {
                prefix: PREFIX_55AA,
                seqno: BigEndian::read_u32(&data[4..8]),
                cmd: BigEndian::read_u32(&data[8..12]),
                payload_len,
                total_length: HEADER_LEN_55AA + payload_len as usize,
            })
        }
        PREFIX_6699 => {
            if data.len() < HEADER_LEN_6699 {
                return Err(TuyaError::DecodeError("6699 header too short".into()));
            }
            // bytes 4..6 are reserved
            let payload_len = BigEndian::read_u32(&data[14..18]);
            Ok(TuyaHeader {
                prefix: PREFIX_6699,
                seqno: BigEndian::read_u32(&data[6..10]),
                cmd: BigEndian::read_u32(&data[10..14]),
                payload_len,
                total_length: HEADER_LEN_6699 + payload_len as usize + SUFFIX_LEN,
            })
        }
        _ => Err(TuyaError::InvalidHeader),
    }
}

/// Encode a message. 55AA frames get an HMAC trailer when `key` is given and a
/// CRC32 otherwise; 6699 frames always need `key` for GCM sealing.
pub fn pack_message(msg: &TuyaMessage, key: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(msg.payload.len() + 64);

    match msg.prefix {
        PREFIX_55AA => {
            let trailer = if key.is_some() { HMAC_LEN } else { CRC_LEN } + SUFFIX_LEN;
            let retcode_len = if msg.retcode.is_some() { RETCODE_LEN } else { 0 };

            data.write_u32::<BigEndian>(PREFIX_55AA)?;
            data.write_u32::<BigEndian>(msg.seqno)?;
            data.write_u32::<BigEndian>(msg.cmd)?;
            data.write_u32::<BigEndian>((retcode_len + msg.payload.len() + trailer) as u32)?;
            if let Some(rc) = msg.retcode {
                data.write_u32::<BigEndian>(rc)?;
            }
            data.extend_from_slice(&msg.payload);

            match key {
                Some(k) => {
                    let mut mac =
                        HmacSha256::new_from_slice(k).map_err(|_| TuyaError::EncryptionFailed)?;
                    mac.update(&data);
                    data.extend_from_slice(&mac.finalize().into_bytes());
                }
                None => {
                    let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&data);
                    data.write_u32::<BigEndian>(crc)?;
                }
            }
            data.write_u32::<BigEndian>(SUFFIX_55AA)?;
        }
        PREFIX_6699 => {
            let key = key.ok_or(TuyaError::EncryptionFailed)?;

            let mut plain = Vec::with_capacity(RETCODE_LEN + msg.payload.len());
            if let Some(rc) = msg.retcode {
                plain.write_u32::<BigEndian>(rc)?;
            }
            plain.extend_from_slice(&msg.payload);

            data.write_u32::<BigEndian>(PREFIX_6699)?;
            data.write_u16::<BigEndian>(0)?;
            data.write_u32::<BigEndian>(msg.seqno)?;
            data.write_u32::<BigEndian>(msg.cmd)?;
            data.write_u32::<BigEndian>((GCM_IV_LEN + plain.len() + GCM_TAG_LEN) as u32)?;

            let iv = match &msg.iv {
                Some(iv) => iv.clone(),
                None => {
                    let mut iv = vec![0u8; GCM_IV_LEN];
                    rand::RngCore::fill_bytes(&mut rand::rng(), &mut iv);
                    iv
                }
            };
            let sealed = TuyaCipher::new(key)?.encrypt_gcm(&plain, &iv, &data[4..])?;
            data.extend_from_slice(&sealed);
            data.write_u32::<BigEndian>(SUFFIX_6699)?;
        }
        other => {
            return Err(TuyaError::DecodeError(format!(
                "unknown prefix 0x{:08X}",
                other
            )));
        }
    }

    Ok(data)
}

/// Decode one frame from the start of `data`.
///
/// `no_retcode`: `Some(true)` never reads a return code, `Some(false)` always
/// does, `None` guesses from the payload shape.
pub fn unpack_message(
    data: &[u8],
    key: Option<&[u8]>,
    no_retcode: Option<bool>,
) -> Result<TuyaMessage> {
    let header = parse_header(data)?;
    let total = header.total_length;
    if data.len() < total {
        return Err(TuyaError::DecodeError("Data shorter than expected".into()));
    }

    if header.prefix == PREFIX_6699 {
        let key = key.ok_or(TuyaError::DecryptionFailed)?;
        let body = &data[HEADER_LEN_6699..total - SUFFIX_LEN];
        if body.len() < GCM_IV_LEN + GCM_TAG_LEN {
            return Err(TuyaError::InvalidPayload);
        }
        let (iv, sealed) = body.split_at(GCM_IV_LEN);
        let mut payload =
            TuyaCipher::new(key)?.decrypt_gcm(sealed, iv, &data[4..HEADER_LEN_6699])?;

        let read_retcode = match no_retcode {
            Some(no) => !no,
            None => {
                payload.len() > RETCODE_LEN
                    && payload[0] != b'{'
                    && matches!(payload[RETCODE_LEN], b'{' | b'3')
            }
        };
        let mut retcode = None;
        if read_retcode && payload.len() >= RETCODE_LEN {
            retcode = Some(BigEndian::read_u32(&payload[..RETCODE_LEN]));
            payload.drain(..RETCODE_LEN);
        }

        return Ok(TuyaMessage {
            seqno: header.seqno,
            cmd: header.cmd,
            retcode,
            payload,
            prefix: PREFIX_6699,
            iv: Some(iv.to_vec()),
        });
    }

    let trailer = if key.is_some() { HMAC_LEN } else { CRC_LEN } + SUFFIX_LEN;
    let payload_end = total
        .checked_sub(trailer)
        .filter(|end| *end >= HEADER_LEN_55AA)
        .ok_or_else(|| TuyaError::DecodeError("Frame shorter than its trailer".into()))?;

    let signed = &data[..payload_end];
    let footer = &data[payload_end..total];
    match key {
        Some(k) => {
            let mut mac = HmacSha256::new_from_slice(k).map_err(|_| TuyaError::EncryptionFailed)?;
            mac.update(signed);
            mac.verify_slice(&footer[..HMAC_LEN])
                .map_err(|_| TuyaError::HmacMismatch)?;
        }
        None => {
            let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(signed);
            if crc != BigEndian::read_u32(&footer[..CRC_LEN]) {
                return Err(TuyaError::CrcMismatch);
            }
        }
    }

    let mut start = HEADER_LEN_55AA;
    let available = payload_end - start;
    let read_retcode = match no_retcode {
        Some(no) => !no,
        None => {
            available >= RETCODE_LEN
                && data[start] != b'{'
                && (data[start] == 0 || (available > RETCODE_LEN && data[start] != b'3'))
        }
    };
    let mut retcode = None;
    if read_retcode && available >= RETCODE_LEN {
        retcode = Some(BigEndian::read_u32(&data[start..start + RETCODE_LEN]));
        start += RETCODE_LEN;
    }

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode,
        payload: data[start..payload_end].to_vec(),
        prefix: PREFIX_55AA,
        iv: None,
    })
}
