//! x-tunnel pack codec
//!
//! All integers little-endian.
//!
//! Roundtrip request:
//! ```text
//! 'P' ver 2 | session_id[8] | transfer_no u32 | server_timeout u8
//!   | data_len u32 | ack_len u16 | download_timeout_len u16
//!   | data: (seq u32, len u32, payload)*
//!   | ack: cumulative u32, selective u32*
//!   | download_timeout: count u32, seq u32*
//! ```
//! Roundtrip response:
//! ```text
//! 'P' ver 2 | server_time f64 | time_cost u32 | send_pool u32
//!   | data_len ack_len rcvd_no_len sent_no_len unack_snd_sn_len ext_len (u32 each)
//!   | sections... | md5 hex of everything before it
//! ```

use super::{
    ProtocolError, ServerErrorCode, CHECKSUM_LEN, MAGIC, PACK_ERROR, PACK_LOGIN, PACK_ROUNDTRIP,
    PROTOCOL_VERSION, SESSION_ID_LEN,
};
use crate::crypto::Cipher;
use crate::tunnel::TunnelBlock;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed part of a roundtrip response after magic/version/type
const RESPONSE_HEAD_LEN: usize = 8 + 4 * 8;

/// Cumulative + selective acknowledgement
///
/// `next_expected` is the first sequence not yet received; on the wire the
/// cumulative field is the last sequence received (`next_expected - 1`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckInfo {
    pub next_expected: u64,
    /// Received sequences above `next_expected`
    pub selective: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub session_id: [u8; SESSION_ID_LEN],
    pub max_payload: u32,
    pub send_delay_ms: u16,
    pub windows_size: u32,
    pub windows_ack: u32,
    pub resend_timeout_ms: u16,
    pub ack_delay_ms: u16,
    pub account: String,
    pub password: String,
    pub extra_info: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub res: u8,
    pub message: String,
}

impl LoginResponse {
    pub fn is_success(&self) -> bool {
        self.res == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoundtripRequest {
    pub session_id: [u8; SESSION_ID_LEN],
    pub transfer_no: u32,
    /// Seconds the server may hold the request open
    pub server_timeout: u8,
    pub blocks: Vec<TunnelBlock>,
    pub ack: Option<AckInfo>,
    /// Sequences the server should resend
    pub download_timeouts: Vec<u64>,
}

/// Server's view of our transfer numbers
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransferReport {
    /// Every transfer below this one is done
    pub next: u32,
    /// Out-of-order transfers with server timestamps
    pub unordered: Vec<(u32, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct RoundtripData {
    /// Server clock (seconds since the epoch)
    pub server_time: f64,
    /// Time the server held the request (ms)
    pub time_cost_ms: u32,
    pub server_send_pool_size: u32,
    pub blocks: Vec<TunnelBlock>,
    pub ack: Option<AckInfo>,
    pub received: Option<TransferReport>,
    pub sent: Option<TransferReport>,
    /// Blocks the server sent that we have not acked, with send time
    pub unacked_sent: Vec<(u64, f64)>,
    pub ext: Bytes,
}

#[derive(Debug, Clone)]
pub enum RoundtripResponse {
    Data(RoundtripData),
    Error { code: ServerErrorCode, message: String },
}

/// Turns tunnel packs into HTTP bodies and back
pub trait BlockCodec: Send + Sync {
    fn encode_login(&self, req: &LoginRequest) -> Result<Bytes, ProtocolError>;

    fn decode_login_response(&self, body: &[u8]) -> Result<LoginResponse, ProtocolError>;

    fn encode_roundtrip(&self, req: &RoundtripRequest) -> Result<Bytes, ProtocolError>;

    fn decode_roundtrip(&self, body: &[u8]) -> Result<RoundtripResponse, ProtocolError>;
}

/// Bounds-checked little-endian reader
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &'static str) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Truncated(what));
        }
        Ok(())
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ProtocolError> {
        self.need(2, what)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn f64(&mut self, what: &'static str) -> Result<f64, ProtocolError> {
        self.need(8, what)?;
        Ok(self.buf.get_f64_le())
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        self.need(n, what)?;
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn string(&mut self, n: usize, what: &'static str) -> Result<String, ProtocolError> {
        Ok(String::from_utf8_lossy(self.take(n, what)?).into_owned())
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

fn wire_u32(value: u64, what: &'static str) -> Result<u32, ProtocolError> {
    u32::try_from(value).map_err(|_| ProtocolError::FieldTooLarge(what, value as usize))
}

fn wire_u16(value: usize, what: &'static str) -> Result<u16, ProtocolError> {
    u16::try_from(value).map_err(|_| ProtocolError::FieldTooLarge(what, value))
}

fn put_str16(buf: &mut BytesMut, s: &str, what: &'static str) -> Result<(), ProtocolError> {
    buf.put_u16_le(wire_u16(s.len(), what)?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Reads magic, version and pack type
fn read_head(r: &mut Reader<'_>) -> Result<u8, ProtocolError> {
    let magic = r.u8("magic")?;
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }
    let version = r.u8("version")?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }
    r.u8("pack type")
}

fn encode_blocks(blocks: &[TunnelBlock]) -> Result<BytesMut, ProtocolError> {
    let mut buf = BytesMut::with_capacity(blocks.iter().map(|b| 8 + b.len()).sum());
    for block in blocks {
        buf.put_u32_le(wire_u32(block.sequence, "sequence")?);
        buf.put_u32_le(wire_u32(block.len() as u64, "block length")?);
        buf.put_slice(&block.payload);
    }
    Ok(buf)
}

fn decode_blocks(section: &[u8]) -> Result<Vec<TunnelBlock>, ProtocolError> {
    let mut r = Reader::new(section);
    let mut blocks = Vec::new();
    while !r.is_empty() {
        let sequence = r.u32("block header")? as u64;
        let len = r.u32("block header")? as usize;
        let payload = Bytes::copy_from_slice(r.take(len, "block payload")?);
        blocks.push(TunnelBlock::new(sequence, payload));
    }
    Ok(blocks)
}

fn encode_ack(ack: &Option<AckInfo>) -> Result<BytesMut, ProtocolError> {
    let mut buf = BytesMut::new();
    if let Some(ack) = ack {
        buf.put_u32_le(wire_u32(ack.next_expected.saturating_sub(1), "ack")?);
        for seq in &ack.selective {
            buf.put_u32_le(wire_u32(*seq, "ack")?);
        }
    }
    Ok(buf)
}

fn decode_ack(section: &[u8]) -> Result<Option<AckInfo>, ProtocolError> {
    if section.is_empty() {
        return Ok(None);
    }
    if section.len() % 4 != 0 {
        return Err(ProtocolError::LengthMismatch(format!("ack section of {} bytes", section.len())));
    }
    let mut r = Reader::new(section);
    let cumulative = r.u32("ack")? as u64;
    let mut selective = Vec::with_capacity(r.remaining() / 4);
    while !r.is_empty() {
        selective.push(r.u32("ack")? as u64);
    }
    Ok(Some(AckInfo {
        next_expected: cumulative + 1,
        selective,
    }))
}

fn encode_transfer_report(report: &Option<TransferReport>) -> BytesMut {
    let mut buf = BytesMut::new();
    if let Some(report) = report {
        buf.put_u32_le(report.next);
        buf.put_u32_le(report.unordered.len() as u32);
        for (no, t) in &report.unordered {
            buf.put_u32_le(*no);
            buf.put_f64_le(*t);
        }
    }
    buf
}

fn decode_transfer_report(section: &[u8]) -> Result<Option<TransferReport>, ProtocolError> {
    if section.is_empty() {
        return Ok(None);
    }
    let mut r = Reader::new(section);
    let next = r.u32("transfer report")?;
    let count = r.u32("transfer report")? as usize;
    let mut unordered = Vec::with_capacity(count.min(r.remaining() / 12));
    for _ in 0..count {
        unordered.push((r.u32("transfer report")?, r.f64("transfer report")?));
    }
    Ok(Some(TransferReport { next, unordered }))
}

fn decode_unacked(section: &[u8]) -> Result<Vec<(u64, f64)>, ProtocolError> {
    if section.is_empty() {
        return Ok(Vec::new());
    }
    let mut r = Reader::new(section);
    let count = r.u32("unacked list")? as usize;
    let mut list = Vec::with_capacity(count.min(r.remaining() / 12));
    for _ in 0..count {
        list.push((r.u32("unacked list")? as u64, r.f64("unacked list")?));
    }
    Ok(list)
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// The x-tunnel binary framing
#[derive(Debug, Clone, Copy, Default)]
pub struct XTunnelCodec;

impl XTunnelCodec {
    pub fn new() -> Self {
        Self
    }

    /// Server half: parse a login request
    pub fn decode_login_request(&self, body: &[u8]) -> Result<LoginRequest, ProtocolError> {
        let mut r = Reader::new(body);
        let pack = read_head(&mut r)?;
        if pack != PACK_LOGIN {
            return Err(ProtocolError::InvalidPackType(pack));
        }
        let mut session_id = [0u8; SESSION_ID_LEN];
        session_id.copy_from_slice(r.take(SESSION_ID_LEN, "session id")?);

        let max_payload = r.u32("login")?;
        let send_delay_ms = r.u16("login")?;
        let windows_size = r.u32("login")?;
        let windows_ack = r.u32("login")?;
        let resend_timeout_ms = r.u16("login")?;
        let ack_delay_ms = r.u16("login")?;

        let n = r.u16("account")? as usize;
        let account = r.string(n, "account")?;
        let n = r.u16("password")? as usize;
        let password = r.string(n, "password")?;
        let n = r.u16("extra info")? as usize;
        let extra_info = serde_json::from_slice(r.take(n, "extra info")?)?;

        Ok(LoginRequest {
            session_id,
            max_payload,
            send_delay_ms,
            windows_size,
            windows_ack,
            resend_timeout_ms,
            ack_delay_ms,
            account,
            password,
            extra_info,
        })
    }

    /// Server half: build a login response
    pub fn encode_login_response(&self, resp: &LoginResponse) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(6 + resp.message.len());
        buf.put_u8(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(PACK_LOGIN);
        buf.put_u8(resp.res);
        put_str16(&mut buf, &resp.message, "login message")?;
        Ok(buf.freeze())
    }

    /// Server half: parse a roundtrip request
    pub fn decode_roundtrip_request(&self, body: &[u8]) -> Result<RoundtripRequest, ProtocolError> {
        let mut r = Reader::new(body);
        let pack = read_head(&mut r)?;
        if pack != PACK_ROUNDTRIP {
            return Err(ProtocolError::InvalidPackType(pack));
        }
        let mut session_id = [0u8; SESSION_ID_LEN];
        session_id.copy_from_slice(r.take(SESSION_ID_LEN, "session id")?);
        let transfer_no = r.u32("roundtrip head")?;
        let server_timeout = r.u8("roundtrip head")?;
        let data_len = r.u32("roundtrip head")? as usize;
        let ack_len = r.u16("roundtrip head")? as usize;
        let timeout_len = r.u16("roundtrip head")? as usize;

        if r.remaining() != data_len + ack_len + timeout_len {
            return Err(ProtocolError::LengthMismatch(format!(
                "sections {}+{}+{} vs body {}",
                data_len,
                ack_len,
                timeout_len,
                r.remaining()
            )));
        }

        let blocks = decode_blocks(r.take(data_len, "data")?)?;
        let ack = decode_ack(r.take(ack_len, "ack")?)?;

        let mut download_timeouts = Vec::new();
        let mut t = Reader::new(r.take(timeout_len, "download timeouts")?);
        if !t.is_empty() {
            let count = t.u32("download timeouts")?;
            for _ in 0..count {
                download_timeouts.push(t.u32("download timeouts")? as u64);
            }
        }

        Ok(RoundtripRequest {
            session_id,
            transfer_no,
            server_timeout,
            blocks,
            ack,
            download_timeouts,
        })
    }

    /// Server half: build a roundtrip response (with checksum)
    pub fn encode_roundtrip_response(&self, resp: &RoundtripResponse) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_u8(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);

        match resp {
            RoundtripResponse::Error { code, message } => {
                buf.put_u8(PACK_ERROR);
                buf.put_u8((*code).into());
                put_str16(&mut buf, message, "error message")?;
                Ok(buf.freeze())
            }
            RoundtripResponse::Data(data) => {
                buf.put_u8(PACK_ROUNDTRIP);

                let blocks = encode_blocks(&data.blocks)?;
                let ack = encode_ack(&data.ack)?;
                let received = encode_transfer_report(&data.received);
                let sent = encode_transfer_report(&data.sent);
                let mut unacked = BytesMut::new();
                if !data.unacked_sent.is_empty() {
                    unacked.put_u32_le(data.unacked_sent.len() as u32);
                    for (seq, t) in &data.unacked_sent {
                        unacked.put_u32_le(wire_u32(*seq, "unacked sequence")?);
                        unacked.put_f64_le(*t);
                    }
                }

                buf.put_f64_le(data.server_time);
                buf.put_u32_le(data.time_cost_ms);
                buf.put_u32_le(data.server_send_pool_size);
                for section in [&blocks[..], &ack[..], &received[..], &sent[..], &unacked[..], &data.ext[..]] {
                    buf.put_u32_le(section.len() as u32);
                }
                for section in [&blocks[..], &ack[..], &received[..], &sent[..], &unacked[..], &data.ext[..]] {
                    buf.put_slice(section);
                }

                let checksum = md5_hex(&buf);
                buf.put_slice(checksum.as_bytes());
                Ok(buf.freeze())
            }
        }
    }
}

impl BlockCodec for XTunnelCodec {
    fn encode_login(&self, req: &LoginRequest) -> Result<Bytes, ProtocolError> {
        let extra = serde_json::to_vec(&req.extra_info)?;
        let mut buf = BytesMut::with_capacity(
            3 + SESSION_ID_LEN + 18 + 6 + req.account.len() + req.password.len() + extra.len(),
        );
        buf.put_u8(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(PACK_LOGIN);
        buf.put_slice(&req.session_id);
        buf.put_u32_le(req.max_payload);
        buf.put_u16_le(req.send_delay_ms);
        buf.put_u32_le(req.windows_size);
        buf.put_u32_le(req.windows_ack);
        buf.put_u16_le(req.resend_timeout_ms);
        buf.put_u16_le(req.ack_delay_ms);
        put_str16(&mut buf, &req.account, "account")?;
        put_str16(&mut buf, &req.password, "password")?;
        buf.put_u16_le(wire_u16(extra.len(), "extra info")?);
        buf.put_slice(&extra);
        Ok(buf.freeze())
    }

    fn decode_login_response(&self, body: &[u8]) -> Result<LoginResponse, ProtocolError> {
        let mut r = Reader::new(body);
        let pack = read_head(&mut r)?;
        if pack != PACK_LOGIN {
            return Err(ProtocolError::InvalidPackType(pack));
        }
        let res = r.u8("login result")?;
        let n = r.u16("login message")? as usize;
        let message = r.string(n, "login message")?;
        Ok(LoginResponse { res, message })
    }

    fn encode_roundtrip(&self, req: &RoundtripRequest) -> Result<Bytes, ProtocolError> {
        let data = encode_blocks(&req.blocks)?;
        let ack = encode_ack(&req.ack)?;
        let mut timeouts = BytesMut::new();
        if !req.download_timeouts.is_empty() {
            timeouts.put_u32_le(req.download_timeouts.len() as u32);
            for seq in &req.download_timeouts {
                timeouts.put_u32_le(wire_u32(*seq, "download timeout")?);
            }
        }

        let mut buf = BytesMut::with_capacity(3 + SESSION_ID_LEN + 13 + data.len() + ack.len() + timeouts.len());
        buf.put_u8(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(PACK_ROUNDTRIP);
        buf.put_slice(&req.session_id);
        buf.put_u32_le(req.transfer_no);
        buf.put_u8(req.server_timeout);
        buf.put_u32_le(wire_u32(data.len() as u64, "data section")?);
        buf.put_u16_le(wire_u16(ack.len(), "ack section")?);
        buf.put_u16_le(wire_u16(timeouts.len(), "download timeout section")?);
        buf.put_slice(&data);
        buf.put_slice(&ack);
        buf.put_slice(&timeouts);
        Ok(buf.freeze())
    }

    fn decode_roundtrip(&self, body: &[u8]) -> Result<RoundtripResponse, ProtocolError> {
        let mut r = Reader::new(body);
        let pack = read_head(&mut r)?;

        match pack {
            PACK_ERROR => {
                let code = ServerErrorCode::from(r.u8("error code")?);
                let n = r.u16("error message")? as usize;
                let message = r.string(n, "error message")?;
                Ok(RoundtripResponse::Error { code, message })
            }
            PACK_ROUNDTRIP => {
                if body.len() < 3 + RESPONSE_HEAD_LEN + CHECKSUM_LEN {
                    return Err(ProtocolError::Truncated("roundtrip head"));
                }
                let server_time = r.f64("roundtrip head")?;
                let time_cost_ms = r.u32("roundtrip head")?;
                let server_send_pool_size = r.u32("roundtrip head")?;
                let mut lens = [0usize; 6];
                for len in lens.iter_mut() {
                    *len = r.u32("roundtrip head")? as usize;
                }

                let sections: usize = lens.iter().sum();
                if r.remaining() != sections + CHECKSUM_LEN {
                    return Err(ProtocolError::LengthMismatch(format!(
                        "sections {} + checksum vs body {}",
                        sections,
                        r.remaining()
                    )));
                }

                let (content, checksum) = body.split_at(body.len() - CHECKSUM_LEN);
                if md5_hex(content).as_bytes() != checksum {
                    return Err(ProtocolError::Checksum);
                }

                let blocks = decode_blocks(r.take(lens[0], "data")?)?;
                let ack = decode_ack(r.take(lens[1], "ack")?)?;
                let received = decode_transfer_report(r.take(lens[2], "received report")?)?;
                let sent = decode_transfer_report(r.take(lens[3], "sent report")?)?;
                let unacked_sent = decode_unacked(r.take(lens[4], "unacked list")?)?;
                let ext = Bytes::copy_from_slice(r.take(lens[5], "ext")?);

                Ok(RoundtripResponse::Data(RoundtripData {
                    server_time,
                    time_cost_ms,
                    server_send_pool_size,
                    blocks,
                    ack,
                    received,
                    sent,
                    unacked_sent,
                    ext,
                }))
            }
            other => Err(ProtocolError::InvalidPackType(other)),
        }
    }
}

/// Seals whole request bodies and opens whole response bodies
pub struct EncryptedCodec<C> {
    inner: C,
    cipher: Cipher,
}

impl<C: BlockCodec> EncryptedCodec<C> {
    pub fn new(inner: C, cipher: Cipher) -> Self {
        Self { inner, cipher }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn seal(&self, body: &[u8]) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(self.cipher.seal(body)?))
    }

    pub fn open(&self, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.cipher.open(body)?)
    }
}

impl<C: BlockCodec> BlockCodec for EncryptedCodec<C> {
    fn encode_login(&self, req: &LoginRequest) -> Result<Bytes, ProtocolError> {
        self.seal(&self.inner.encode_login(req)?)
    }

    fn decode_login_response(&self, body: &[u8]) -> Result<LoginResponse, ProtocolError> {
        self.inner.decode_login_response(&self.open(body)?)
    }

    fn encode_roundtrip(&self, req: &RoundtripRequest) -> Result<Bytes, ProtocolError> {
        self.seal(&self.inner.encode_roundtrip(req)?)
    }

    fn decode_roundtrip(&self, body: &[u8]) -> Result<RoundtripResponse, ProtocolError> {
        self.inner.decode_roundtrip(&self.open(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_block_key, EncryptMethod};

    fn block(seq: u64, data: &'static [u8]) -> TunnelBlock {
        TunnelBlock::new(seq, Bytes::from_static(data))
    }

    fn sample_response() -> RoundtripResponse {
        RoundtripResponse::Data(RoundtripData {
            server_time: 1_700_000_000.25,
            time_cost_ms: 120,
            server_send_pool_size: 3,
            blocks: vec![block(1, b"first"), block(3, b"third")],
            ack: Some(AckInfo {
                next_expected: 5,
                selective: vec![7, 9],
            }),
            received: Some(TransferReport {
                next: 4,
                unordered: vec![(6, 1.5)],
            }),
            sent: None,
            unacked_sent: vec![(2, 1_699_999_990.0)],
            ext: Bytes::new(),
        })
    }

    #[test]
    fn test_login_request_layout() {
        let codec = XTunnelCodec::new();
        let req = LoginRequest {
            session_id: *b"abcdefgh",
            max_payload: 65536,
            send_delay_ms: 10,
            windows_size: 1024,
            windows_ack: 256,
            resend_timeout_ms: 5000,
            ack_delay_ms: 300,
            account: "user".into(),
            password: "pw".into(),
            extra_info: serde_json::json!({"version": "0.1.0"}),
        };
        let body = codec.encode_login(&req).unwrap();
        assert_eq!(&body[..3], &[b'P', 2, 1]);
        assert_eq!(&body[3..11], b"abcdefgh");
        assert_eq!(&body[11..15], &65536u32.to_le_bytes());

        let back = codec.decode_login_request(&body).unwrap();
        assert_eq!(back.account, "user");
        assert_eq!(back.ack_delay_ms, 300);
        assert_eq!(back.extra_info["version"], "0.1.0");
    }

    #[test]
    fn test_roundtrip_request_ack_is_last_received() {
        let codec = XTunnelCodec::new();
        let req = RoundtripRequest {
            session_id: *b"abcdefgh",
            transfer_no: 7,
            server_timeout: 15,
            blocks: vec![block(1, b"hello")],
            ack: Some(AckInfo {
                next_expected: 4,
                selective: vec![6],
            }),
            download_timeouts: vec![5],
        };
        let body = codec.encode_roundtrip(&req).unwrap();

        // head: 3 + 8 + 4 + 1 + 4 + 2 + 2 = 24
        let data_len = u32::from_le_bytes(body[16..20].try_into().unwrap());
        assert_eq!(data_len, 8 + 5);
        let ack_at = 24 + data_len as usize;
        assert_eq!(&body[ack_at..ack_at + 4], &3u32.to_le_bytes());

        let back = codec.decode_roundtrip_request(&body).unwrap();
        assert_eq!(back.transfer_no, 7);
        assert_eq!(back.ack, req.ack);
        assert_eq!(back.download_timeouts, vec![5]);
        assert_eq!(back.blocks[0].payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_response_decode() {
        let codec = XTunnelCodec::new();
        let body = codec.encode_roundtrip_response(&sample_response()).unwrap();

        match codec.decode_roundtrip(&body).unwrap() {
            RoundtripResponse::Data(data) => {
                assert_eq!(data.time_cost_ms, 120);
                assert_eq!(data.blocks.len(), 2);
                assert_eq!(data.blocks[1].sequence, 3);
                assert_eq!(data.ack.unwrap().next_expected, 5);
                assert_eq!(data.received.unwrap().next, 4);
                assert!(data.sent.is_none());
                assert_eq!(data.unacked_sent, vec![(2, 1_699_999_990.0)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_checksum_mismatch_is_transient() {
        let codec = XTunnelCodec::new();
        let body = codec.encode_roundtrip_response(&sample_response()).unwrap();
        let mut damaged = body.to_vec();
        let mid = damaged.len() / 2;
        damaged[mid] ^= 0xff;

        let err = codec.decode_roundtrip(&damaged).unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }

    #[test]
    fn test_structural_errors_are_fatal() {
        let codec = XTunnelCodec::new();
        let body = codec.encode_roundtrip_response(&sample_response()).unwrap();

        let mut bad_magic = body.to_vec();
        bad_magic[0] = b'X';
        let err = codec.decode_roundtrip(&bad_magic).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMagic(b'X')));
        assert!(!err.is_transient());

        let truncated = &body[..body.len() - 40];
        assert!(!codec.decode_roundtrip(truncated).unwrap_err().is_transient());

        let mut bad_version = body.to_vec();
        bad_version[1] = 9;
        assert!(matches!(
            codec.decode_roundtrip(&bad_version),
            Err(ProtocolError::VersionMismatch { actual: 9, .. })
        ));
    }

    #[test]
    fn test_error_pack() {
        let codec = XTunnelCodec::new();
        let body = codec
            .encode_roundtrip_response(&RoundtripResponse::Error {
                code: ServerErrorCode::SessionNotExist,
                message: "gone".into(),
            })
            .unwrap();
        match codec.decode_roundtrip(&body).unwrap() {
            RoundtripResponse::Error { code, message } => {
                assert_eq!(code, ServerErrorCode::SessionNotExist);
                assert_eq!(message, "gone");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encrypted_codec() {
        let key = derive_block_key("secret").unwrap();
        let cipher = Cipher::new(EncryptMethod::ChaCha20Poly1305, &key).unwrap();
        let codec = EncryptedCodec::new(XTunnelCodec::new(), cipher);

        let req = RoundtripRequest {
            transfer_no: 1,
            blocks: vec![block(1, b"payload")],
            ..RoundtripRequest::default()
        };
        let sealed = codec.encode_roundtrip(&req).unwrap();
        assert!(!sealed.windows(7).any(|w| w == b"payload"));

        let plain = codec.open(&sealed).unwrap();
        let back = codec.inner().decode_roundtrip_request(&plain).unwrap();
        assert_eq!(back.blocks[0].payload, Bytes::from_static(b"payload"));

        let response = codec
            .seal(&XTunnelCodec::new().encode_roundtrip_response(&sample_response()).unwrap())
            .unwrap();
        assert!(matches!(
            codec.decode_roundtrip(&response).unwrap(),
            RoundtripResponse::Data(_)
        ));
    }
}
