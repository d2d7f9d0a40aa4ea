//! BSD-style sockets on top of stateless AT commands.
//!
//! The modem numbers sockets 0..[`MAX_SOCKS`] on creation, so a socket
//! entry here is identified by the modem-assigned index. Payloads travel
//! inline as uppercase hex (two characters per byte, `+UDCONF=1,1` set at
//! startup) in chunks of 32 raw bytes. Receive readiness is
//! signaled by `+UUSORD`/`+UUSORF` URCs through a per-socket notify;
//! the URC handler may fire it spuriously, which only costs an extra
//! zero-length `+USORD` exchange.
//!
//! A socket entry that was never closed properly (missed `+UUSOCL`) can
//! collide with a fresh modem-side socket reusing the index. Creation
//! detects this, immediately closes the fresh modem socket, and fails.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::at::args::{self, Val};
use crate::at::writer::Arg;
use crate::cmd::CmdId;
use crate::driver::{Driver, Prompt, Request, Shared};
use crate::error::{Error, ParseError, Result};
use crate::slot::SlotDone;

/// Socket table capacity, matching the modem's.
pub const MAX_SOCKS: usize = 7;
/// Hex scratch size; [`CHUNK`] raw bytes fill half of it.
const HEX_BUF: usize = 128;
/// Receive reply cap: header fields plus one hex-coded chunk.
const HEX_RXBUF: usize = HEX_BUF + 32;
/// Raw bytes moved per read/write exchange.
const CHUNK: usize = HEX_BUF / 4;

/// Modem TLS profile used for the single secured socket.
const TLS_PROFILE: i64 = 1;
/// Internal certificate names on the modem.
const CERT_NAMES: [&[u8]; 3] = [b"cacerts", b"clicert", b"clipkey"];

/// Socket protocol, using the IP protocol numbers the modem expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp = 6,
    Udp = 17,
}

/// CA verification policy for [`Driver::secure_socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertVerify {
    /// No CA verification; certificate installation is bypassed.
    #[default]
    None,
    Optional,
    Required,
}

/// TLS profile parameters.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub verify: CertVerify,
    pub ca_cert: Option<Vec<u8>>,
    pub client_cert: Option<Vec<u8>>,
    pub private_key: Option<Vec<u8>>,
    /// Expected server hostname; enables hostname pinning when set.
    pub hostname: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct SockState {
    pub acquired: bool,
    pub proto: u8,
    pub to_be_closed: bool,
    /// Receive timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// One socket table entry.
pub(crate) struct Sock {
    pub state: Mutex<SockState>,
    /// Receive-readiness signal, fired from URC handling. Monotonic
    /// "maybe ready": a spurious wake re-polls and sleeps again.
    pub rx: Notify,
}

impl Sock {
    pub(crate) fn new() -> Self {
        Sock {
            state: Mutex::new(SockState::default()),
            rx: Notify::new(),
        }
    }
}

impl Shared {
    /// Remote close observed (`+UUSOCL`): flag the entry, free the TLS
    /// slot if it was the secured socket, wake any waiter.
    pub(crate) fn socket_closing(&self, id: usize) {
        let Some(sock) = self.sockets.get(id) else {
            return;
        };
        sock.state.lock().unwrap().to_be_closed = true;
        let _ = self
            .secure_sock
            .compare_exchange(id as i32, -1, Ordering::AcqRel, Ordering::Relaxed);
        sock.rx.notify_one();
    }

    /// Data pending (`+UUSORD`/`+UUSORF`): wake any waiter.
    pub(crate) fn socket_pending(&self, id: usize) {
        if let Some(sock) = self.sockets.get(id) {
            sock.rx.notify_one();
        }
    }
}

impl Driver {
    fn sock_entry(&self, id: i32) -> Result<&Sock> {
        let idx = usize::try_from(id)
            .map_err(|_| Error::InvalidState("socket index out of range"))?;
        let sock = self
            .shared()
            .sockets
            .get(idx)
            .ok_or(Error::InvalidState("socket index out of range"))?;
        if !sock.state.lock().unwrap().acquired {
            return Err(Error::InvalidState("socket not acquired"));
        }
        Ok(sock)
    }

    /// Create a socket of the given protocol. Returns the modem-assigned id.
    pub async fn socket(&self, proto: Proto) -> Result<i32> {
        let done = self
            .exchange(
                Request::new(CmdId::Usocr, "=%d", &[Arg::Int(proto as i64)])
                    .reply(32, 1)
                    .timeout(self.t(2)),
            )
            .await?;
        let id = int_field(&done, 0)?;
        let idx =
            usize::try_from(id).map_err(|_| Error::Parse(ParseError::Args))?;
        let sock = self
            .shared()
            .sockets
            .get(idx)
            .ok_or(Error::Parse(ParseError::Args))?;

        let collided = {
            let mut st = sock.state.lock().unwrap();
            if st.acquired {
                true
            } else {
                *st = SockState {
                    acquired: true,
                    proto: proto as u8,
                    to_be_closed: false,
                    timeout: None,
                };
                false
            }
        };
        if collided {
            // A previous socket with this id was never closed properly.
            // Close the fresh modem-side socket right away so the two
            // can't be confused, and fail the create.
            warn!("socket {idx} still acquired, closing modem socket");
            let _ = self
                .exchange(
                    Request::new(CmdId::Usocl, "=%d", &[Arg::Int(id)]).timeout(self.t(15)),
                )
                .await;
            return Err(Error::InvalidState("socket index still in use"));
        }
        debug!("socket {idx} created ({proto:?})");
        Ok(id as i32)
    }

    /// Connect a TCP socket. Blocks up to the command timeout (~30 s).
    pub async fn connect(&self, sock: i32, addr: Ipv4Addr, port: u16) -> Result<()> {
        self.sock_entry(sock)?;
        let addr = addr.to_string();
        self.exchange(
            Request::new(
                CmdId::Usoco,
                "=%d,%\"s,%u",
                &[
                    Arg::Int(i64::from(sock)),
                    Arg::Str(addr.as_bytes()),
                    Arg::Uint(u64::from(port)),
                ],
            )
            .timeout(self.t(30)),
        )
        .await?;
        Ok(())
    }

    /// Close a socket. Errors from the modem are tolerated: a remote close
    /// may have raced us.
    pub async fn close(&self, sock: i32) -> Result<()> {
        let entry = self.sock_entry(sock)?;
        let already_closing = entry.state.lock().unwrap().to_be_closed;
        if !already_closing {
            let res = self
                .exchange(
                    Request::new(CmdId::Usocl, "=%d", &[Arg::Int(i64::from(sock))])
                        .timeout(self.t(15)),
                )
                .await;
            if let Err(e) = res {
                debug!("close socket {sock}: {e}");
            }
        }
        {
            let mut st = entry.state.lock().unwrap();
            st.acquired = false;
            st.to_be_closed = true;
        }
        let _ = self.shared().secure_sock.compare_exchange(
            sock,
            -1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        entry.rx.notify_one();
        Ok(())
    }

    /// Send on a stream socket, hex-framing 32 bytes per exchange.
    pub async fn send(&self, sock: i32, buf: &[u8]) -> Result<usize> {
        let entry = self.sock_entry(sock)?;
        if entry.state.lock().unwrap().to_be_closed {
            return Err(Error::InvalidState("socket closing"));
        }
        let mut written = 0usize;
        let mut hex = Vec::with_capacity(HEX_BUF);
        while written < buf.len() {
            let chunk = &buf[written..(written + CHUNK).min(buf.len())];
            hex.clear();
            bin_to_hex(chunk, &mut hex);
            let done = self
                .exchange(
                    Request::new(
                        CmdId::Usowr,
                        "=%d,%d,%\"s",
                        &[
                            Arg::Int(i64::from(sock)),
                            Arg::Int(chunk.len() as i64),
                            Arg::Str(&hex),
                        ],
                    )
                    .reply(16, 1)
                    .timeout(self.t(10)),
                )
                .await?;
            let sent = int_field(&done, 1)?;
            if sent <= 0 {
                break;
            }
            written += sent as usize;
        }
        Ok(written)
    }

    /// Send a datagram, destination included in every exchange.
    pub async fn send_to(
        &self,
        sock: i32,
        buf: &[u8],
        addr: Ipv4Addr,
        port: u16,
    ) -> Result<usize> {
        let entry = self.sock_entry(sock)?;
        {
            let st = entry.state.lock().unwrap();
            if st.to_be_closed {
                return Err(Error::InvalidState("socket closing"));
            }
            if st.proto != Proto::Udp as u8 {
                return Err(Error::InvalidState("not a datagram socket"));
            }
        }
        let addr = addr.to_string();
        let mut written = 0usize;
        let mut hex = Vec::with_capacity(HEX_BUF);
        while written < buf.len() {
            let chunk = &buf[written..(written + CHUNK).min(buf.len())];
            hex.clear();
            bin_to_hex(chunk, &mut hex);
            let done = self
                .exchange(
                    Request::new(
                        CmdId::Usost,
                        "=%d,%\"s,%u,%d,%\"s",
                        &[
                            Arg::Int(i64::from(sock)),
                            Arg::Str(addr.as_bytes()),
                            Arg::Uint(u64::from(port)),
                            Arg::Int(chunk.len() as i64),
                            Arg::Str(&hex),
                        ],
                    )
                    .reply(16, 1)
                    .timeout(self.t(10)),
                )
                .await?;
            let sent = int_field(&done, 1)?;
            if sent <= 0 {
                break;
            }
            written += sent as usize;
        }
        Ok(written)
    }

    /// Receive into `buf`, honoring the per-socket timeout. Blocks on the
    /// readiness signal whenever the modem reports zero available bytes;
    /// a remote close while waiting returns the bytes read so far.
    pub async fn recv(&self, sock: i32, buf: &mut [u8]) -> Result<usize> {
        let entry = self.sock_entry(sock)?;
        let timeout = {
            let st = entry.state.lock().unwrap();
            if st.to_be_closed {
                return Err(Error::InvalidState("socket closing"));
            }
            st.timeout
        };
        let mut read = 0usize;
        while read < buf.len() {
            let want = (buf.len() - read).min(CHUNK);
            let done = match self
                .exchange(
                    Request::new(
                        CmdId::Usord,
                        "=%d,%d",
                        &[Arg::Int(i64::from(sock)), Arg::Int(want as i64)],
                    )
                    .reply(HEX_RXBUF, 1)
                    .timeout(self.t(10)),
                )
                .await
            {
                Ok(done) => done,
                Err(e) if read > 0 => {
                    debug!("recv on {sock} after {read} bytes: {e}");
                    return Ok(read);
                }
                Err(e) => return Err(e),
            };
            let avail = int_field(&done, 1)?;
            if avail > 0 {
                let vals = args::require(&done.reply, "iiS")?;
                let hex = vals[2].as_bytes().ok_or(Error::Parse(ParseError::Args))?;
                let take = (avail as usize).min(buf.len() - read);
                let n = hex_to_bin(hex, &mut buf[read..read + take]);
                read += n;
            } else {
                if !self.wait_rx(entry, timeout).await? {
                    return Ok(read);
                }
            }
        }
        Ok(read)
    }

    /// Receive a single datagram; returns the byte count and the source
    /// address and port.
    pub async fn recv_from(
        &self,
        sock: i32,
        buf: &mut [u8],
    ) -> Result<(usize, (Ipv4Addr, u16))> {
        let entry = self.sock_entry(sock)?;
        let timeout = {
            let st = entry.state.lock().unwrap();
            if st.to_be_closed {
                return Err(Error::InvalidState("socket closing"));
            }
            if st.proto != Proto::Udp as u8 {
                return Err(Error::InvalidState("not a datagram socket"));
            }
            st.timeout
        };
        loop {
            let want = buf.len().min(CHUNK);
            let done = self
                .exchange(
                    Request::new(
                        CmdId::Usorf,
                        "=%d,%d",
                        &[Arg::Int(i64::from(sock)), Arg::Int(want as i64)],
                    )
                    .reply(HEX_RXBUF, 1)
                    .timeout(self.t(10)),
                )
                .await?;
            let avail = int_field(&done, 1)?;
            if avail > 0 {
                let vals = args::require(&done.reply, "iiSiS")?;
                let ip_text = vals[2].to_text().ok_or(Error::Parse(ParseError::Args))?;
                let port = vals[3].as_int().ok_or(Error::Parse(ParseError::Args))?;
                let hex = vals[4].as_bytes().ok_or(Error::Parse(ParseError::Args))?;
                let ip: Ipv4Addr = ip_text
                    .parse()
                    .map_err(|_| Error::Parse(ParseError::Args))?;
                let take = (avail as usize).min(buf.len());
                let n = hex_to_bin(hex, &mut buf[..take]);
                return Ok((n, (ip, port as u16)));
            }
            if !self.wait_rx(entry, timeout).await? {
                return Ok((0, (Ipv4Addr::UNSPECIFIED, 0)));
            }
        }
    }

    /// Wait for the readiness signal. `Ok(true)` means "poll again",
    /// `Ok(false)` means the socket was closed remotely while waiting.
    async fn wait_rx(&self, sock: &Sock, timeout: Option<Duration>) -> Result<bool> {
        match timeout {
            Some(t) => {
                if tokio::time::timeout(t, sock.rx.notified()).await.is_err() {
                    return Err(Error::Timeout);
                }
            }
            None => sock.rx.notified().await,
        }
        Ok(!sock.state.lock().unwrap().to_be_closed)
    }

    /// Poll the given sockets for read readiness, round-robin with a
    /// 100 ms pause between sweeps. Returns the first socket reporting
    /// available bytes, or an empty list when the deadline elapses.
    pub async fn select_read(
        &self,
        socks: &[i32],
        timeout: Option<Duration>,
    ) -> Result<Vec<i32>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            for &id in socks {
                if self.sock_entry(id).is_err() {
                    continue;
                }
                let done = match self
                    .exchange(
                        Request::new(CmdId::Usord, "=%d,%d", &[Arg::Int(i64::from(id)), Arg::Int(0)])
                            .reply(HEX_RXBUF, 1)
                            .timeout(self.t(10)),
                    )
                    .await
                {
                    Ok(done) => done,
                    Err(_) => continue,
                };
                if int_field(&done, 1).map(|n| n > 0).unwrap_or(false) {
                    return Ok(vec![id]);
                }
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Ok(Vec::new());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Set a socket option at level `0xffff`: option 1 is the local
    /// receive timeout in milliseconds, option 8 forwards keepalive to the
    /// modem. Unknown options succeed silently.
    pub async fn set_sockopt(
        &self,
        sock: i32,
        level: u32,
        option: u32,
        value: i32,
    ) -> Result<()> {
        let entry = self.sock_entry(sock)?;
        if entry.state.lock().unwrap().to_be_closed {
            return Err(Error::InvalidState("socket closing"));
        }
        if level == 0xffff && option == 1 {
            let timeout = if value > 0 {
                Some(Duration::from_millis(value as u64))
            } else {
                None
            };
            entry.state.lock().unwrap().timeout = timeout;
        } else if level == 0xffff && option == 8 {
            self.exchange(
                Request::new(
                    CmdId::Usoso,
                    "=%d,%u,%u,%d",
                    &[
                        Arg::Int(i64::from(sock)),
                        Arg::Uint(u64::from(level)),
                        Arg::Uint(u64::from(option)),
                        Arg::Int(i64::from(value != 0)),
                    ],
                )
                .timeout(self.t(5)),
            )
            .await?;
        }
        Ok(())
    }

    /// Query the last socket error via `+USOCTL=<sock>,1`.
    pub async fn socket_error(&self, sock: i32) -> Result<i32> {
        let done = self
            .exchange(
                Request::new(
                    CmdId::Usoctl,
                    "=%d,%d",
                    &[Arg::Int(i64::from(sock)), Arg::Int(1)],
                )
                .reply(16, 1)
                .timeout(self.t(1)),
            )
            .await?;
        Ok(int_field(&done, 2)? as i32)
    }

    // ── TLS ──────────────────────────────────────────────────────────

    /// Create the one TLS-secured TCP socket: configure the security
    /// profile, install certificates per the policy, create the socket
    /// and bind it to the profile. Fails immediately while another
    /// secured socket is live.
    pub async fn secure_socket(&self, tls: &TlsConfig) -> Result<i32> {
        if self.shared().secure_sock.load(Ordering::Acquire) >= 0 {
            return Err(Error::InvalidState("TLS socket already in use"));
        }

        self.tls_profile_reset().await?;
        // Minimum TLS 1.0, automatic cipher suite.
        self.tls_profile_int(1, 1).await?;
        self.tls_profile_int(2, 0).await?;

        match (&tls.verify, &tls.ca_cert) {
            (CertVerify::None, _) | (_, None) => {
                self.tls_profile_int(0, 0).await?;
            }
            (_, Some(ca)) => {
                self.tls_load(0, ca).await?;
                self.tls_profile_str(3, CERT_NAMES[0]).await?;
                match &tls.hostname {
                    Some(host) => {
                        self.tls_profile_int(0, 3).await?;
                        self.tls_profile_str(4, host.as_bytes()).await?;
                    }
                    None => {
                        self.tls_profile_int(0, 1).await?;
                    }
                }
            }
        }
        if let Some(cert) = &tls.client_cert {
            self.tls_profile_str(5, CERT_NAMES[1]).await?;
            self.tls_load(1, cert).await?;
        }
        if let Some(key) = &tls.private_key {
            self.tls_profile_str(6, CERT_NAMES[2]).await?;
            self.tls_load(2, key).await?;
        }

        let sock = self.socket(Proto::Tcp).await?;
        let bound = self
            .exchange(
                Request::new(
                    CmdId::Usosec,
                    "=%d,%d,%d",
                    &[Arg::Int(i64::from(sock)), Arg::Int(1), Arg::Int(TLS_PROFILE)],
                )
                .timeout(self.t(10)),
            )
            .await;
        if let Err(e) = bound {
            let _ = self.close(sock).await;
            return Err(e);
        }
        self.shared().secure_sock.store(sock, Ordering::Release);
        Ok(sock)
    }

    async fn tls_profile_reset(&self) -> Result<()> {
        self.exchange(
            Request::new(CmdId::Usecprf, "=%d", &[Arg::Int(TLS_PROFILE)]).timeout(self.t(5)),
        )
        .await?;
        Ok(())
    }

    async fn tls_profile_int(&self, opcode: i64, param: i64) -> Result<()> {
        self.exchange(
            Request::new(
                CmdId::Usecprf,
                "=%d,%d,%d",
                &[Arg::Int(TLS_PROFILE), Arg::Int(opcode), Arg::Int(param)],
            )
            .timeout(self.t(5)),
        )
        .await?;
        Ok(())
    }

    async fn tls_profile_str(&self, opcode: i64, param: &[u8]) -> Result<()> {
        self.exchange(
            Request::new(
                CmdId::Usecprf,
                "=%d,%d,%\"s",
                &[Arg::Int(TLS_PROFILE), Arg::Int(opcode), Arg::Str(param)],
            )
            .timeout(self.t(5)),
        )
        .await?;
        Ok(())
    }

    /// Upload certificate material via the `+USECMNG` prompt.
    async fn tls_load(&self, kind: i64, data: &[u8]) -> Result<()> {
        let done = self
            .exchange(
                Request::new(
                    CmdId::Usecmng,
                    "=%d,%d,%\"s,%d",
                    &[
                        Arg::Int(0),
                        Arg::Int(kind),
                        Arg::Str(CERT_NAMES[kind as usize]),
                        Arg::Int(data.len() as i64),
                    ],
                )
                .reply(256, 1)
                .timeout(self.t(20))
                .prompt(Prompt {
                    payload: data,
                    trailer: b"",
                }),
            )
            .await?;
        args::require(&done.reply, "iiss")?;
        Ok(())
    }
}

fn int_field(done: &SlotDone, idx: usize) -> Result<i64> {
    args::split(&done.reply, "iiii")
        .get(idx)
        .and_then(Val::as_int)
        .ok_or(Error::Parse(ParseError::Args))
}

/// Encode bytes as uppercase hex, two characters per byte.
pub(crate) fn bin_to_hex(src: &[u8], dst: &mut Vec<u8>) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    for &b in src {
        dst.push(DIGITS[(b >> 4) as usize]);
        dst.push(DIGITS[(b & 0x0f) as usize]);
    }
}

/// Decode hex pairs into `dst`, stopping at the first non-hex character or
/// when `dst` is full. Returns the number of decoded bytes.
pub(crate) fn hex_to_bin(hex: &[u8], dst: &mut [u8]) -> usize {
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'A'..=b'F' => Some(c - b'A' + 10),
            b'a'..=b'f' => Some(c - b'a' + 10),
            _ => None,
        }
    }
    let mut n = 0;
    let mut pairs = hex.chunks_exact(2);
    for pair in &mut pairs {
        if n == dst.len() {
            break;
        }
        let (Some(hi), Some(lo)) = (nibble(pair[0]), nibble(pair[1])) else {
            break;
        };
        dst[n] = (hi << 4) | lo;
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let data: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
        let mut hex = Vec::new();
        bin_to_hex(&data, &mut hex);
        assert_eq!(hex.len(), data.len() * 2);
        assert!(hex.iter().all(|c| c.is_ascii_digit() || (b'A'..=b'F').contains(c)));
        let mut back = vec![0u8; data.len()];
        assert_eq!(hex_to_bin(&hex, &mut back), data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn test_hex_encode_known_bytes() {
        let mut hex = Vec::new();
        bin_to_hex(&[0xDE, 0xAD, 0xBE, 0xEF], &mut hex);
        assert_eq!(hex, b"DEADBEEF");
    }

    #[test]
    fn test_hex_decode_lowercase_and_garbage() {
        let mut out = [0u8; 4];
        assert_eq!(hex_to_bin(b"cafebabe", &mut out), 4);
        assert_eq!(out, [0xCA, 0xFE, 0xBA, 0xBE]);
        // Truncated pair and non-hex characters stop the decode.
        assert_eq!(hex_to_bin(b"41Z2", &mut out), 1);
        assert_eq!(out[0], 0x41);
    }

    #[test]
    fn test_hex_decode_respects_destination_len() {
        let mut out = [0u8; 2];
        assert_eq!(hex_to_bin(b"AABBCCDD", &mut out), 2);
        assert_eq!(out, [0xAA, 0xBB]);
    }
}
