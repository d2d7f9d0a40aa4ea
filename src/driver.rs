//! Driver life-cycle and the command-exchange engine.
//!
//! The architecture: one dedicated reader thread has exclusive access to
//! the serial port in input, and every task issuing an AT command must
//! acquire the single command slot and wait its turn. Once the slot is
//! held, the exchange is fixed — send the command, wait for the reader's
//! completion signal, parse the reply, release. The reader can fail a
//! slot with a timeout, so no client can stall the loop for longer than
//! the slot deadline.
//!
//! Startup configuration runs before the loop owns the port, driving the
//! request writer and response parser directly over the transport.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::at::parser::{RspParser, TransportSource};
use crate::at::writer::{Arg, CmdWriter};
use crate::cmd::{self, CmdId};
use crate::config::Config;
use crate::error::{Error, ParseError, Result};
use crate::reader;
use crate::slot::{ActiveSlot, Outcome, SlotDone, SmsCapture};
use crate::socket::{Sock, MAX_SOCKS};
use crate::transport::{SerialPort, Transport};
use crate::urc::{NetStatus, RegStatus};

/// How long a slot owner waits for the `>` prompt before giving up and
/// letting the slot deadline take over.
const PROMPT_WAIT: Duration = Duration::from_secs(10);

/// Control-line sequencing, wired to whatever GPIO layer the board uses.
/// The pin ids in [`PinConfig`](crate::PinConfig) are for the implementor;
/// the driver only says what to drive when.
pub trait ControlLines: Send + Sync {
    fn set_power(&self, on: bool) -> std::io::Result<()>;
    fn set_reset(&self, on: bool) -> std::io::Result<()>;
    fn set_dtr(&self, on: bool) -> std::io::Result<()>;
    fn set_rts(&self, on: bool) -> std::io::Result<()>;
}

/// For boards where the modem is powered externally.
pub struct NullControlLines;

impl ControlLines for NullControlLines {
    fn set_power(&self, _on: bool) -> std::io::Result<()> {
        Ok(())
    }
    fn set_reset(&self, _on: bool) -> std::io::Result<()> {
        Ok(())
    }
    fn set_dtr(&self, _on: bool) -> std::io::Result<()> {
        Ok(())
    }
    fn set_rts(&self, _on: bool) -> std::io::Result<()> {
        Ok(())
    }
}

/// State shared between driver handles and the reader thread.
pub(crate) struct Shared {
    pub cfg: Config,
    pub transport: Arc<dyn Transport>,
    /// Guards every write to the serial device.
    pub write_lock: Mutex<()>,
    /// Serializes slot owners.
    pub slot_order: Arc<tokio::sync::Mutex<()>>,
    /// The in-flight exchange, read by the reader to attribute lines.
    pub slot: Mutex<Option<ActiveSlot>>,
    pub sockets: Vec<Sock>,
    pub net: Mutex<NetStatus>,
    /// Last `+CME ERROR` message text (≤ 32 bytes).
    pub errmsg: Mutex<String>,
    pub pending_sms: AtomicI32,
    /// Modem index of the TLS-secured socket, -1 when none.
    pub secure_sock: AtomicI32,
    /// Externally requested run state.
    pub talking: AtomicBool,
    /// Loop echo of the run state.
    pub running: AtomicBool,
}

/// Cloneable handle to one modem.
///
/// All state lives behind an `Arc`, so clones are cheap and every clone
/// talks to the same modem. Operations on a stopped driver fail with
/// [`Error::InvalidState`] without touching the serial port.
#[derive(Clone)]
pub struct Driver {
    shared: Arc<Shared>,
    lines: Arc<dyn ControlLines>,
    reader: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

/// Raw payload sent after the modem's `>` prompt.
pub(crate) struct Prompt<'a> {
    pub payload: &'a [u8],
    pub trailer: &'a [u8],
}

/// One command exchange, built with the chained setters.
pub(crate) struct Request<'a> {
    cmd: CmdId,
    spec: &'a str,
    args: &'a [Arg<'a>],
    max_size: usize,
    timeout: Duration,
    expected: u32,
    prompt: Option<Prompt<'a>>,
    sms: Option<SmsCapture>,
}

impl<'a> Request<'a> {
    pub fn new(cmd: CmdId, spec: &'a str, args: &'a [Arg<'a>]) -> Self {
        Request {
            cmd,
            spec,
            args,
            max_size: 0,
            timeout: Duration::ZERO,
            expected: 0,
            prompt: None,
            sms: None,
        }
    }

    /// Expect `lines` parameter lines, buffering up to `max_size` bytes.
    pub fn reply(mut self, max_size: usize, lines: u32) -> Self {
        self.max_size = max_size;
        self.expected = lines;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prompt(mut self, prompt: Prompt<'a>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn sms(mut self, capture: SmsCapture) -> Self {
        self.max_size = self.max_size.max(64);
        self.sms = Some(capture);
        self
    }
}

impl Driver {
    /// Build a driver over an explicit transport and control lines.
    pub fn new(
        cfg: Config,
        transport: Arc<dyn Transport>,
        lines: Arc<dyn ControlLines>,
    ) -> Driver {
        let shared = Arc::new(Shared {
            cfg,
            transport,
            write_lock: Mutex::new(()),
            slot_order: Arc::new(tokio::sync::Mutex::new(())),
            slot: Mutex::new(None),
            sockets: (0..MAX_SOCKS).map(|_| Sock::new()).collect(),
            net: Mutex::new(NetStatus::default()),
            errmsg: Mutex::new(String::new()),
            pending_sms: AtomicI32::new(0),
            secure_sock: AtomicI32::new(-1),
            talking: AtomicBool::new(false),
            running: AtomicBool::new(false),
        });
        Driver {
            shared,
            lines,
            reader: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the serial device named in `cfg` and build a driver over it.
    pub fn open(cfg: Config) -> Result<Driver> {
        let port = SerialPort::open(&cfg.serial)?;
        info!("modem {}: opened ({} 8N1)", cfg.serial.device, cfg.serial.baud);
        Ok(Driver::new(cfg, Arc::new(port), Arc::new(NullControlLines)))
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Base command deadline times `mult`.
    pub(crate) fn t(&self, mult: u64) -> Duration {
        Duration::from_millis(self.shared.cfg.timeouts.command_ms.saturating_mul(mult))
    }

    /// True while the I/O loop is servicing the port.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Power the modem on, run the startup AT configuration, and start
    /// the I/O loop. Safe to call again after [`Driver::stop`].
    pub async fn start(&self) -> Result<()> {
        let _gate = self.shared.slot_order.lock().await;
        self.stop_loop().await?;

        self.power_on()?;
        self.configure()?;

        {
            // The modem restarted; stale network state is meaningless.
            let mut net = self.shared.net.lock().unwrap();
            net.attached = false;
            net.registered = RegStatus::Not;
            net.gsm = RegStatus::Not;
            net.gprs = RegStatus::Not;
        }

        {
            let mut handle = self.reader.lock().unwrap();
            if handle.is_none() {
                *handle = Some(reader::spawn(&self.shared)?);
            }
        }
        self.shared.talking.store(true, Ordering::Release);

        for _ in 0..30 {
            if self.is_running() {
                info!("driver started");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(Error::Timeout)
    }

    /// Park the I/O loop. In-flight exchanges finish first.
    pub async fn stop(&self) -> Result<()> {
        let _gate = self.shared.slot_order.lock().await;
        self.stop_loop().await
    }

    /// Stop the loop, probe the modem, and put it into minimum
    /// functionality (`AT+CFUN=0`).
    pub async fn shutdown(&self) -> Result<()> {
        let _gate = self.shared.slot_order.lock().await;
        self.stop_loop().await?;

        let mut p = RspParser::new(TransportSource::new(&*self.shared.transport));
        p.flush();
        self.write_guarded(b"ATE0\r\n")?;
        if wait_for_ok(&mut p, 500) {
            self.write_guarded(b"AT+CFUN=0\r\n")?;
            if !wait_for_ok(&mut p, 15_000) {
                warn!("modem did not confirm minimum functionality");
            }
        }
        info!("driver shut down");
        Ok(())
    }

    /// Suspend the loop and hand out raw access to the serial port. The
    /// slot stays locked until the guard is resumed or dropped; a dropped
    /// guard leaves the loop parked until the next [`Driver::start`].
    pub async fn bypass(&self) -> Result<Bypass> {
        let gate = self.shared.slot_order.clone().lock_owned().await;
        self.stop_loop().await?;
        Ok(Bypass {
            driver: self.clone(),
            _gate: gate,
        })
    }

    async fn stop_loop(&self) -> Result<()> {
        if self.shared.talking.swap(false, Ordering::AcqRel) {
            for _ in 0..50 {
                if !self.is_running() {
                    debug!("loop parked");
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// G350 power timing: power-on and reset held high, DTR and RTS low
    /// to disable hardware flow control.
    fn power_on(&self) -> Result<()> {
        self.lines.set_power(true)?;
        self.lines.set_reset(true)?;
        self.lines.set_dtr(false)?;
        self.lines.set_rts(false)?;
        Ok(())
    }

    /// Initial AT configuration: echo off, verbose errors, event
    /// reporting, hex mode for sockets, registration URCs, SMS text mode
    /// and indications.
    fn configure(&self) -> Result<()> {
        let line_ms = self.shared.cfg.timeouts.startup_line_ms as u32;
        let mut p = RspParser::new(TransportSource::new(&*self.shared.transport));
        p.flush();

        self.raw_command(&mut p, b"ATE0\r\n", line_ms)?;
        self.raw_command(&mut p, b"AT+GMR\r\n", line_ms)?;
        self.raw_command(&mut p, b"AT+CMEE=2\r\n", line_ms)?;
        self.raw_command(&mut p, b"AT+CMER=2,0,0,2,1\r\n", line_ms)?;
        self.raw_command(&mut p, b"AT+UDCONF=1,1\r\n", 1000)?;
        self.raw_command(&mut p, b"AT+CREG=2\r\n", line_ms)?;
        self.raw_command(&mut p, b"AT+CGREG=2\r\n", line_ms)?;
        self.raw_command(&mut p, b"AT+CMGF=1\r\n", line_ms)?;
        self.raw_command(&mut p, b"AT+CSCS=\"IRA\"\r\n", line_ms)?;
        self.raw_command(&mut p, b"AT+CSCA?\r\n", line_ms)?;
        self.raw_command(&mut p, b"AT+CNMI=2,1,0,0,0\r\n", line_ms)?;
        Ok(())
    }

    fn raw_command(
        &self,
        p: &mut RspParser<TransportSource<'_>>,
        command: &[u8],
        timeout_ms: u32,
    ) -> Result<()> {
        self.write_guarded(command)?;
        if wait_for_ok(p, timeout_ms) {
            Ok(())
        } else {
            Err(Error::Modem(format!(
                "no OK for {}",
                String::from_utf8_lossy(command).trim_end()
            )))
        }
    }

    pub(crate) fn write_guarded(&self, bytes: &[u8]) -> Result<()> {
        let _g = self.shared.write_lock.lock().unwrap();
        self.shared.transport.write(bytes)?;
        Ok(())
    }

    fn send_prompt_payload(&self, payload: &[u8], trailer: &[u8]) -> Result<()> {
        let _g = self.shared.write_lock.lock().unwrap();
        for chunk in payload.chunks(64) {
            self.shared.transport.write(chunk)?;
        }
        if !trailer.is_empty() {
            self.shared.transport.write(trailer)?;
        }
        Ok(())
    }

    fn clear_slot(&self) {
        self.shared.slot.lock().unwrap().take();
    }

    /// Run one command exchange: acquire the slot, send, wait for the
    /// reader's completion, and map the outcome.
    pub(crate) async fn exchange(&self, req: Request<'_>) -> Result<SlotDone> {
        if !self.is_running() {
            return Err(Error::InvalidState("driver not running"));
        }
        let _gate = self.shared.slot_order.lock().await;

        let desc = cmd::get(req.cmd);
        let timeout = if req.timeout.is_zero() {
            self.t(1)
        } else {
            req.timeout
        };
        let (mut slot, done_rx) = ActiveSlot::new(desc, req.max_size, timeout, req.expected);
        slot.sms = req.sms;
        let prompt_rx = req.prompt.as_ref().map(|_| {
            let (tx, rx) = oneshot::channel();
            slot.prompt = Some(tx);
            rx
        });
        *self.shared.slot.lock().unwrap() = Some(slot);

        let mut w = CmdWriter::new(Vec::with_capacity(64));
        w.atc(desc.body);
        w.fmt(req.spec, req.args);
        w.chr(b'\r');
        let line = match w.finish() {
            Ok(line) => line,
            Err(e) => {
                self.clear_slot();
                return Err(Error::Io(e));
            }
        };
        debug!("->: {}", String::from_utf8_lossy(&line));
        if let Err(e) = self.write_guarded(&line) {
            self.clear_slot();
            return Err(e);
        }

        if let (Some(rx), Some(prompt)) = (prompt_rx, req.prompt) {
            match tokio::time::timeout(PROMPT_WAIT, rx).await {
                Ok(Ok(())) => {
                    if let Err(e) = self.send_prompt_payload(prompt.payload, prompt.trailer) {
                        self.clear_slot();
                        return Err(e);
                    }
                }
                // The reader already completed the slot (error path).
                Ok(Err(_)) => {}
                Err(_) => warn!("prompt for {} never arrived", desc.body),
            }
        }

        let done = done_rx
            .await
            .map_err(|_| Error::InvalidState("driver stopped"))?;
        debug!("slot {} complete ({} lines)", desc.body, done.lines);
        match done.outcome {
            Outcome::Ok => Ok(done),
            Outcome::Timeout => Err(Error::Timeout),
            Outcome::Error(msg) => Err(Error::Modem(msg)),
        }
    }
}

/// Raw-port access while the loop is suspended.
pub struct Bypass {
    driver: Driver,
    _gate: tokio::sync::OwnedMutexGuard<()>,
}

impl Bypass {
    pub fn transport(&self) -> &dyn Transport {
        &*self.driver.shared.transport
    }

    /// Restart the loop and release the slot.
    pub async fn resume(self) -> Result<()> {
        self.driver.shared.talking.store(true, Ordering::Release);
        for _ in 0..30 {
            if self.driver.is_running() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(Error::Timeout)
    }
}

/// Absorb the echo, skim information lines, and stop at the terminal.
fn wait_for_ok(p: &mut RspParser<TransportSource<'_>>, timeout_ms: u32) -> bool {
    if p.echo(timeout_ms) == 0 {
        return false;
    }
    for _ in 0..16 {
        if p.final_result() > 0 {
            return p.status().is_ok();
        }
        match p.error() {
            Some(ParseError::FinalUnknown) => {
                p.clear_error();
                if p.line_dump() == 0 {
                    return false;
                }
            }
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Proto;
    use crate::transport::mock::MockTransport;
    use std::net::Ipv4Addr;

    const STARTUP: &[(&str, &[u8])] = &[
        ("ATE0", b"\r\nOK\r\n"),
        ("AT+GMR", b"\r\n07.70.03\r\nOK\r\n"),
        ("AT+CMEE=2", b"\r\nOK\r\n"),
        ("AT+CMER=2,0,0,2,1", b"\r\nOK\r\n"),
        ("AT+UDCONF=1,1", b"\r\nOK\r\n"),
        ("AT+CREG=2", b"\r\nOK\r\n"),
        ("AT+CGREG=2", b"\r\nOK\r\n"),
        ("AT+CMGF=1", b"\r\nOK\r\n"),
        ("AT+CSCS=\"IRA\"", b"\r\nOK\r\n"),
        ("AT+CSCA?", b"\r\n+CSCA: \"+393492000200\",145\r\n\r\nOK\r\n"),
        ("AT+CNMI=2,1,0,0,0", b"\r\nOK\r\n"),
    ];

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.timeouts.command_ms = 200;
        cfg.timeouts.startup_line_ms = 200;
        cfg
    }

    async fn started_driver() -> (Driver, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::new());
        for (frag, reply) in STARTUP {
            mock.expect(frag, reply);
        }
        let driver = Driver::new(test_config(), mock.clone(), Arc::new(NullControlLines));
        driver.start().await.expect("startup");
        (driver, mock)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_startup_sequence() {
        let (driver, mock) = started_driver().await;
        assert!(driver.is_running());
        let written = mock.written();
        assert!(written.starts_with("ATE0\r\n"));
        assert!(written.contains("AT+CMEE=2"));
        assert!(written.contains("AT+UDCONF=1,1"));
        assert!(written.contains("AT+CNMI=2,1,0,0,0"));
        driver.stop().await.unwrap();
        assert!(!driver.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_startup_fails_without_modem() {
        let mock = Arc::new(MockTransport::new());
        let driver = Driver::new(test_config(), mock, Arc::new(NullControlLines));
        assert!(driver.start().await.is_err());
        assert!(!driver.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_not_running_is_invalid_state() {
        let mock = Arc::new(MockTransport::new());
        let driver = Driver::new(test_config(), mock, Arc::new(NullControlLines));
        match driver.resolve("example.com").await {
            Err(Error::InvalidState(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dns_resolve() {
        let (driver, mock) = started_driver().await;
        mock.expect(
            "AT+UDNSRN=0,\"example.com\"",
            b"\r\n+UDNSRN: \"93.184.216.34\"\r\n\r\nOK\r\n",
        );
        let addr = driver.resolve("example.com").await.unwrap();
        assert_eq!(addr, "93.184.216.34");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_udp_round_trip() {
        let (driver, mock) = started_driver().await;

        mock.expect("AT+USOCR=17", b"\r\n+USOCR: 0\r\n\r\nOK\r\n");
        let sock = driver.socket(Proto::Udp).await.unwrap();
        assert_eq!(sock, 0);

        mock.expect(
            "AT+USOST=0,\"8.8.8.8\",53,4,\"DEADBEEF\"",
            b"\r\n+USOST: 0,4\r\n\r\nOK\r\n",
        );
        let sent = driver
            .send_to(sock, &[0xDE, 0xAD, 0xBE, 0xEF], Ipv4Addr::new(8, 8, 8, 8), 53)
            .await
            .unwrap();
        assert_eq!(sent, 4);

        // Datagram arrives: URC first, then the read returns it.
        mock.push(b"\r\n+UUSORF: 0,4\r\n");
        mock.expect(
            "AT+USORF=0,4",
            b"\r\n+USORF: 0,4,\"1.2.3.4\",9999,\"CAFEBABE\"\r\n\r\nOK\r\n",
        );
        let mut buf = [0u8; 4];
        let (n, (addr, port)) = driver.recv_from(sock, &mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(addr, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(port, 9999);
        assert_eq!(buf, [0xCA, 0xFE, 0xBA, 0xBE]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_close_during_recv() {
        let (driver, mock) = started_driver().await;

        mock.expect("AT+USOCR=6", b"\r\n+USOCR: 2\r\n\r\nOK\r\n");
        let sock = driver.socket(Proto::Tcp).await.unwrap();
        assert_eq!(sock, 2);

        // Zero bytes available, then the peer closes while we wait.
        mock.expect(
            "AT+USORD=2,4",
            b"\r\n+USORD: 2,0\r\n\r\nOK\r\n\r\n+UUSOCL: 2\r\n",
        );
        let mut buf = [0u8; 4];
        let n = driver.recv(sock, &mut buf).await.unwrap();
        assert_eq!(n, 0);

        // The entry is flagged; the next receive fails without any
        // modem interaction.
        match driver.recv(sock, &mut buf).await {
            Err(Error::InvalidState(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slot_timeout_then_recovery() {
        let (driver, mock) = started_driver().await;

        // No response to +CREG? — the reader must fail the slot.
        match driver.check_network().await {
            Err(Error::Timeout) => {}
            other => panic!("unexpected {other:?}"),
        }

        // The slot is free again.
        mock.expect("AT+CCID", b"\r\n+CCID: 8939107800023416395\r\n\r\nOK\r\n");
        let iccid = driver.iccid().await.unwrap();
        assert_eq!(iccid, "8939107800023416395");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sms_send_via_prompt() {
        let (driver, mock) = started_driver().await;

        mock.expect("AT+CMGS=\"+15551234567\"", b"> ");
        mock.expect("Hello\x1a", b"\r\n+CMGS: 42\r\n\r\nOK\r\n");
        let mr = driver.sms_send("+15551234567", "Hello").await.unwrap();
        assert_eq!(mr, 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_socket_create_collision_closes_fresh_socket() {
        let (driver, mock) = started_driver().await;

        mock.expect("AT+USOCR=6", b"\r\n+USOCR: 1\r\n\r\nOK\r\n");
        let first = driver.socket(Proto::Tcp).await.unwrap();
        assert_eq!(first, 1);

        // The modem hands out the same index again (missed close).
        mock.expect("AT+USOCR=6", b"\r\n+USOCR: 1\r\n\r\nOK\r\n");
        mock.expect("AT+USOCL=1", b"\r\nOK\r\n");
        match driver.socket(Proto::Tcp).await {
            Err(Error::InvalidState(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(mock.written().contains("AT+USOCL=1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cert_none_skips_certificate_install() {
        let (driver, mock) = started_driver().await;

        mock.expect("AT+USECPRF=1\r", b"\r\nOK\r\n");
        mock.expect("AT+USECPRF=1,1,1", b"\r\nOK\r\n");
        mock.expect("AT+USECPRF=1,2,0", b"\r\nOK\r\n");
        mock.expect("AT+USECPRF=1,0,0", b"\r\nOK\r\n");
        mock.expect("AT+USOCR=6", b"\r\n+USOCR: 3\r\n\r\nOK\r\n");
        mock.expect("AT+USOSEC=3,1,1", b"\r\nOK\r\n");

        let tls = crate::socket::TlsConfig::default();
        let sock = driver.secure_socket(&tls).await.unwrap();
        assert_eq!(sock, 3);
        assert!(!mock.written().contains("+USECMNG"));

        // A second TLS socket is refused while the first is live.
        match driver.secure_socket(&tls).await {
            Err(Error::InvalidState(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_urc_mid_response_does_not_corrupt_slot() {
        let (driver, mock) = started_driver().await;

        // A signal-level URC lands between the information line and the
        // terminal; it must be dispatched without touching the slot.
        mock.expect(
            "AT+UDNSRN=0,\"one.one.one.one\"",
            b"\r\n+UDNSRN: \"1.1.1.1\"\r\n\r\n+CIEV: 2,3\r\n\r\nOK\r\n",
        );
        let addr = driver.resolve("one.one.one.one").await.unwrap();
        assert_eq!(addr, "1.1.1.1");
        assert_eq!(driver.network_info().rssi_level, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stray_prompt_is_ignored() {
        let (driver, mock) = started_driver().await;

        // A `>` for a command that cannot enter prompt mode is dropped.
        mock.expect(
            "AT+UDNSRN=0,\"example.org\"",
            b"> \r\n\r\n+UDNSRN: \"93.184.216.34\"\r\n\r\nOK\r\n",
        );
        let addr = driver.resolve("example.org").await.unwrap();
        assert_eq!(addr, "93.184.216.34");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sms_body_size_extremes() {
        let (driver, mock) = started_driver().await;

        let long = "A".repeat(160);
        mock.expect("AT+CMGS=\"+15550000001\"", b"> ");
        mock.expect(&format!("{long}\x1a"), b"\r\n+CMGS: 7\r\n\r\nOK\r\n");
        assert_eq!(driver.sms_send("+15550000001", &long).await.unwrap(), 7);

        mock.expect("AT+CMGS=\"+15550000002\"", b"> ");
        mock.expect("X\x1a", b"\r\n+CMGS: 8\r\n\r\nOK\r\n");
        assert_eq!(driver.sms_send("+15550000002", "X").await.unwrap(), 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attach_sequence() {
        let (driver, mock) = started_driver().await;

        mock.expect("AT+CGATT=1", b"\r\nOK\r\n");
        mock.expect("AT+CREG?", b"\r\n+CREG: 0,1\r\n\r\nOK\r\n");
        mock.expect("AT+CGREG?", b"\r\n+CGREG: 0,1\r\n\r\nOK\r\n");
        mock.expect("AT+UPSDA=0,4", b"\r\nOK\r\n");
        mock.expect("AT+UPSD=0,1,\"internet\"", b"\r\nOK\r\n");
        mock.expect("AT+UPSD=0,6,0", b"\r\nOK\r\n");
        mock.expect("AT+UPSDA=0,3", b"\r\nOK\r\n\r\n+UUPSDA: 0\r\n");
        // Fallback poll in case the URC is missed.
        mock.expect("AT+UPSND=0,8", b"\r\n+UPSND: 0,8,1\r\n\r\nOK\r\n");

        driver
            .attach("internet", "", "", 0, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(driver.network_info().attached);
        assert!(driver.network_info().registered);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sockopts_and_recv_timeout() {
        let (driver, mock) = started_driver().await;

        mock.expect("AT+USOCR=6", b"\r\n+USOCR: 0\r\n\r\nOK\r\n");
        let sock = driver.socket(Proto::Tcp).await.unwrap();

        // Keepalive is forwarded to the modem.
        mock.expect("AT+USOSO=0,65535,8,1", b"\r\nOK\r\n");
        driver.set_sockopt(sock, 0xffff, 8, 1).await.unwrap();

        // Receive timeout is stored locally, no AT command involved.
        driver.set_sockopt(sock, 0xffff, 1, 300).await.unwrap();
        // Unknown options succeed silently.
        driver.set_sockopt(sock, 0xffff, 77, 1).await.unwrap();

        mock.expect("AT+USORD=0,4", b"\r\n+USORD: 0,0\r\n\r\nOK\r\n");
        let mut buf = [0u8; 4];
        match driver.recv(sock, &mut buf).await {
            Err(Error::Timeout) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_urc_updates_registration_state() {
        let (driver, mock) = started_driver().await;

        mock.push(b"\r\n+CIEV: 2,4\r\n");
        mock.push(b"\r\n+CGREG: 1,\"00C3\",\"A1B2\"\r\n");
        // Give the reader a moment to apply both URCs.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let info = driver.network_info();
        assert_eq!(info.rssi_level, 4);
        assert!(info.registered);
        assert_eq!(info.lac, "00C3");
        assert_eq!(driver.rssi_dbm(), -105 + 12 * 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_modem_error_is_surfaced_and_retained() {
        let (driver, mock) = started_driver().await;

        mock.expect(
            "AT+UDNSRN=0,\"nosuchhost\"",
            b"\r\n+CME ERROR: DNS error\r\n",
        );
        match driver.resolve("nosuchhost").await {
            Err(Error::Modem(msg)) => assert_eq!(msg, "DNS error"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(driver.last_error(), "DNS error");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sms_list_capture() {
        let (driver, mock) = started_driver().await;

        mock.push(b"\r\n+CMTI: \"SM\",4\r\n");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(driver.sms_pending(), 1);

        mock.expect(
            "AT+CMGL=\"ALL\"",
            b"\r\n+CMGL: 1,\"REC UNREAD\",\"+15551234567\",,\"21/03/23,10:30:00+04\"\r\nHello there\r\n+CMGL: 2,\"REC READ\",\"+15557654321\",,\"21/03/24,09:00:00+04\"\r\nSecond\r\n\r\nOK\r\n",
        );
        let list = driver.sms_list(false, 10, 0).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].index, 1);
        assert!(list[0].unread);
        assert_eq!(list[0].origin, "+15551234567");
        assert_eq!(list[0].text, "Hello there");
        assert!(!list[1].unread);
        assert_eq!(list[1].text, "Second");
        // Listing resets the pending counter.
        assert_eq!(driver.sms_pending(), 0);
    }
}
