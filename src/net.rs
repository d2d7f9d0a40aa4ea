//! High-level network operations: packet-data attachment, DNS, operator
//! selection, cell information, module identity and the real-time clock.
//!
//! Every operation follows the same shape: acquire the slot with a command
//! id, deadline and expected line count; send; wait; parse the reply
//! payload with the argument splitter; release. Attach is the one
//! multi-step sequence (PSD profile configuration plus two polling loops).

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::at::args::{self, strip_quotes, Val};
use crate::at::writer::Arg;
use crate::cmd::CmdId;
use crate::driver::{Driver, Request};
use crate::error::{Error, ParseError, Result};
use crate::urc::{self, RegStatus};

/// PSD profile used for data attachment.
const PSD_PROFILE: i64 = 0;
/// Operator records kept from a `+COPS=?` scan.
pub const MAX_OPS: usize = 6;

const MAX_OP_LONG: usize = 24;
const MAX_OP_SHORT: usize = 10;
const MAX_OP_CODE: usize = 6;

/// One operator record from `+COPS=?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    /// Availability code (0 unknown, 1 available, 2 current, 3 forbidden).
    pub kind: u8,
    pub long_name: String,
    pub short_name: String,
    pub code: String,
}

/// Serving-cell identifiers from `+CGED=3`. Missing values are `-1` or
/// empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellInfo {
    pub mcc: i32,
    pub mnc: i32,
    pub lac: String,
    pub ci: String,
    pub bsic: String,
}

/// Addresses assigned to the active PSD profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub ip: String,
    pub dns: String,
}

/// Snapshot of the URC-fed network state.
#[derive(Debug, Clone)]
pub struct NetInfo {
    pub registered: bool,
    pub attached: bool,
    /// Data-attachment indicator from `+CIEV`.
    pub gprs_indicator: bool,
    /// Technology bits ([`RAT_GSM`](crate::RAT_GSM) | [`RAT_GPRS`](crate::RAT_GPRS)).
    pub tech: u8,
    pub rssi_level: u8,
    pub lac: String,
    pub ci: String,
    pub bsic: String,
    pub rat: String,
}

/// A modem timestamp (`yy/MM/dd,hh:mm:ss±zz`, zone in quarter hours).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub tz_minutes: i32,
}

impl Timestamp {
    /// Parse the modem's fixed-layout timestamp text.
    pub fn parse(text: &str) -> Option<Timestamp> {
        let b = text.as_bytes();
        if b.len() < 20 || b[17] != b'+' && b[17] != b'-' {
            return None;
        }
        let two = |i: usize| -> Option<u8> {
            if b[i].is_ascii_digit() && b[i + 1].is_ascii_digit() {
                Some((b[i] - b'0') * 10 + (b[i + 1] - b'0'))
            } else {
                None
            }
        };
        let tz = i32::from(two(18)?) * 15 * if b[17] == b'-' { -1 } else { 1 };
        Some(Timestamp {
            year: 2000 + u16::from(two(0)?),
            month: two(3)?,
            day: two(6)?,
            hour: two(9)?,
            minute: two(12)?,
            second: two(15)?,
            tz_minutes: tz,
        })
    }
}

impl Driver {
    /// Attach to packet data: `+CGATT=1`, wait for network registration,
    /// configure the PSD profile (APN, credentials, auth mode), activate
    /// it, and wait for the attachment confirmation (`+UUPSDA` URC or
    /// `+UPSND` polling). Can block for minutes.
    pub async fn attach(
        &self,
        apn: &str,
        user: &str,
        password: &str,
        authmode: u8,
        wait: Duration,
    ) -> Result<()> {
        self.exchange(
            Request::new(CmdId::Cgatt, "=%d", &[Arg::Int(1)]).timeout(self.t(180)),
        )
        .await?;

        let deadline = Instant::now() + wait;
        loop {
            let reg = self.check_network().await?;
            if reg.is_registered() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Deactivation may fail when no profile was active; that is fine.
        let _ = self.psd_control(4).await;

        self.psd_config_str(1, apn).await?;
        if !user.is_empty() {
            self.psd_config_str(2, user).await?;
        }
        if !password.is_empty() {
            self.psd_config_str(3, password).await?;
        }
        self.psd_config_int(6, i64::from(authmode)).await?;

        self.shared().net.lock().unwrap().attached = false;
        self.psd_control(3).await?;

        let deadline = Instant::now() + wait;
        loop {
            if self.shared().net.lock().unwrap().attached {
                info!("packet data attached");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.psd_status().await.unwrap_or(false) {
                self.shared().net.lock().unwrap().attached = true;
            }
        }
    }

    /// Drop the PSD link while staying registered on the network.
    pub async fn detach(&self) -> Result<()> {
        self.psd_control(4).await
    }

    /// Resolve a hostname via `+UDNSRN`. Returns the dotted-decimal text.
    pub async fn resolve(&self, host: &str) -> Result<String> {
        let done = self
            .exchange(
                Request::new(CmdId::Udnsrn, "=%d,%\"s", &[Arg::Int(0), Arg::Str(host.as_bytes())])
                    .reply(128, 1)
                    .timeout(self.t(70)),
            )
            .await?;
        let vals = args::require(&done.reply, "S")?;
        vals[0].to_text().ok_or(Error::Parse(ParseError::Args))
    }

    /// Scan for operators (`+COPS=?`). Slow: up to a minute.
    pub async fn operators(&self) -> Result<Vec<Operator>> {
        let done = self
            .exchange(
                Request::new(CmdId::Cops, "=?", &[])
                    .reply(crate::at::parser::MAX_BUF, 1)
                    .timeout(self.t(60)),
            )
            .await?;
        Ok(parse_operators(&done.reply))
    }

    /// Select an operator by its long name (`+COPS=1,0,"<name>"`).
    pub async fn set_operator(&self, name: &str) -> Result<()> {
        self.exchange(
            Request::new(CmdId::Cops, "=1,0,%\"s", &[Arg::Str(name.as_bytes())])
                .timeout(self.t(60)),
        )
        .await?;
        Ok(())
    }

    /// Query `+CREG?`/`+CGREG?`, fold the result into the shared network
    /// state, and return the registration summary.
    pub async fn check_network(&self) -> Result<RegStatus> {
        let done = self
            .exchange(
                Request::new(CmdId::Creg, "?", &[])
                    .reply(64, 1)
                    .timeout(self.t(5)),
            )
            .await?;
        urc::apply_creg(self.shared(), &done.reply, false);

        let done = self
            .exchange(
                Request::new(CmdId::Cgreg, "?", &[])
                    .reply(64, 1)
                    .timeout(self.t(5)),
            )
            .await?;
        urc::apply_cgreg(self.shared(), &done.reply, false);

        Ok(self.shared().net.lock().unwrap().registered)
    }

    /// Serving-cell info via `+CGED=3` (2G/3G layout).
    pub async fn cell_info(&self) -> Result<CellInfo> {
        let done = self
            .exchange(
                Request::new(CmdId::Cged, "=%d", &[Arg::Int(3)])
                    .reply(512, 1)
                    .timeout(self.t(10)),
            )
            .await?;
        let info = parse_cell_info(&done.reply);
        {
            let mut net = self.shared().net.lock().unwrap();
            net.lac = info.lac.clone();
            net.ci = info.ci.clone();
            net.bsic = info.bsic.clone();
        }
        Ok(info)
    }

    /// Module IMEI via `+CGSN`.
    pub async fn imei(&self) -> Result<String> {
        let done = self
            .exchange(
                Request::new(CmdId::Cgsn, "", &[])
                    .reply(64, 1)
                    .timeout(self.t(10)),
            )
            .await?;
        Ok(raw_first_line(&done.reply, 16))
    }

    /// SIM ICCID via `+CCID`.
    pub async fn iccid(&self) -> Result<String> {
        let done = self
            .exchange(
                Request::new(CmdId::Ccid, "", &[])
                    .reply(64, 1)
                    .timeout(self.t(10)),
            )
            .await?;
        let vals = args::require(&done.reply, "s")?;
        let bytes = vals[0].as_bytes().ok_or(Error::Parse(ParseError::Args))?;
        let take = bytes.len().min(22);
        Ok(String::from_utf8_lossy(&bytes[..take]).into_owned())
    }

    /// Modem firmware version via `+GMR`.
    pub async fn firmware_version(&self) -> Result<String> {
        let done = self
            .exchange(
                Request::new(CmdId::Gmr, "", &[])
                    .reply(64, 1)
                    .timeout(self.t(5)),
            )
            .await?;
        Ok(raw_first_line(&done.reply, 64))
    }

    /// Read the modem's real-time clock (`+CCLK?`).
    pub async fn rtc(&self) -> Result<Timestamp> {
        let done = self
            .exchange(
                Request::new(CmdId::Cclk, "?", &[])
                    .reply(32, 1)
                    .timeout(self.t(1)),
            )
            .await?;
        let vals = args::require(&done.reply, "S")?;
        let text = vals[0].to_text().ok_or(Error::Parse(ParseError::Args))?;
        Timestamp::parse(&text).ok_or(Error::Parse(ParseError::Args))
    }

    /// Current radio access technology label via `+URAT?`. Not all G3
    /// modules support the command; those report `GSM`.
    pub async fn rat(&self) -> Result<String> {
        const LABELS: [&str; 3] = ["GSM", "UMTS", "LTE"];
        let sel = match self
            .exchange(
                Request::new(CmdId::Urat, "?", &[])
                    .reply(32, 1)
                    .timeout(self.t(10)),
            )
            .await
        {
            Ok(done) => match args::split(&done.reply, "i").first().and_then(Val::as_int) {
                Some(2) => 1,
                Some(v) if v >= 3 => 2,
                Some(_) => 0,
                None => 0,
            },
            Err(e) => {
                debug!("+URAT unsupported: {e}");
                0
            }
        };
        let label = LABELS[sel].to_string();
        self.shared().net.lock().unwrap().rat = label.clone();
        Ok(label)
    }

    /// IP and DNS assigned to the PSD profile.
    pub async fn link_info(&self) -> Result<LinkInfo> {
        Ok(LinkInfo {
            ip: self.psd_query_str(0).await?,
            dns: self.psd_query_str(1).await?,
        })
    }

    /// Snapshot of the URC-fed network state.
    pub fn network_info(&self) -> NetInfo {
        let net = self.shared().net.lock().unwrap();
        NetInfo {
            registered: net.registered.is_registered(),
            attached: net.attached,
            gprs_indicator: net.gprs_indicator,
            tech: net.tech,
            rssi_level: net.rssi_level,
            lac: net.lac.clone(),
            ci: net.ci.clone(),
            bsic: net.bsic.clone(),
            rat: net.rat.clone(),
        }
    }

    /// Signal strength in dBm, derived from the `+CIEV` level.
    pub fn rssi_dbm(&self) -> i32 {
        -105 + 12 * i32::from(self.shared().net.lock().unwrap().rssi_level)
    }

    /// The last `+CME ERROR` message text.
    pub fn last_error(&self) -> String {
        self.shared().errmsg.lock().unwrap().clone()
    }

    // ── PSD profile plumbing ─────────────────────────────────────────

    async fn psd_control(&self, tag: i64) -> Result<()> {
        self.exchange(
            Request::new(
                CmdId::Upsda,
                "=%d,%d",
                &[Arg::Int(PSD_PROFILE), Arg::Int(tag)],
            )
            .timeout(self.t(180)),
        )
        .await?;
        Ok(())
    }

    async fn psd_config_str(&self, tag: i64, value: &str) -> Result<()> {
        self.exchange(
            Request::new(
                CmdId::Upsd,
                "=%d,%d,%\"s",
                &[
                    Arg::Int(PSD_PROFILE),
                    Arg::Int(tag),
                    Arg::Str(value.as_bytes()),
                ],
            )
            .timeout(self.t(1)),
        )
        .await?;
        Ok(())
    }

    async fn psd_config_int(&self, tag: i64, value: i64) -> Result<()> {
        self.exchange(
            Request::new(
                CmdId::Upsd,
                "=%d,%d,%d",
                &[Arg::Int(PSD_PROFILE), Arg::Int(tag), Arg::Int(value)],
            )
            .timeout(self.t(1)),
        )
        .await?;
        Ok(())
    }

    async fn psd_query(&self, query: i64) -> Result<crate::slot::SlotDone> {
        self.exchange(
            Request::new(
                CmdId::Upsnd,
                "=%d,%d",
                &[Arg::Int(PSD_PROFILE), Arg::Int(query)],
            )
            .reply(64, 1)
            .timeout(self.t(5)),
        )
        .await
    }

    /// `+UPSND=0,8`: profile activation status.
    async fn psd_status(&self) -> Result<bool> {
        let done = self.psd_query(8).await?;
        let vals = args::require(&done.reply, "iii")?;
        Ok(vals[2].as_int() == Some(1))
    }

    async fn psd_query_str(&self, query: i64) -> Result<String> {
        let done = self.psd_query(query).await?;
        let vals = args::require(&done.reply, "iiS")?;
        vals[2].to_text().ok_or(Error::Parse(ParseError::Args))
    }
}

/// First line of a raw reply, capped at `max` bytes.
fn raw_first_line(reply: &[u8], max: usize) -> String {
    let end = reply
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(reply.len());
    let take = end.min(max);
    String::from_utf8_lossy(&reply[..take]).into_owned()
}

/// Parse `+COPS=?` records: `(type,"long","short","code"),…`, ignoring the
/// trailing format lists whose first field is not quoted.
fn parse_operators(reply: &[u8]) -> Vec<Operator> {
    let mut ops = Vec::new();
    let mut rest = reply;
    while ops.len() < MAX_OPS {
        let Some(start) = rest.iter().position(|&c| c == b'(') else {
            break;
        };
        let Some(len) = rest[start..].iter().position(|&c| c == b')') else {
            break;
        };
        let record = &rest[start + 1..start + len];
        rest = &rest[start + len + 1..];

        let vals = args::split(record, "isss");
        if vals.len() != 4 {
            break;
        }
        let (Some(kind), Some(long), Some(short), Some(code)) = (
            vals[0].as_int(),
            vals[1].as_bytes(),
            vals[2].as_bytes(),
            vals[3].as_bytes(),
        ) else {
            break;
        };
        if !long.starts_with(b"\"") {
            break;
        }
        ops.push(Operator {
            kind: kind as u8,
            long_name: capped(strip_quotes(long), MAX_OP_LONG),
            short_name: capped(strip_quotes(short), MAX_OP_SHORT),
            code: capped(strip_quotes(code), MAX_OP_CODE),
        });
    }
    ops
}

/// Parse the `+CGED=3` reply: five `LABEL:value` fields in the order MCC,
/// MNC, LAC, CI, BSIC.
fn parse_cell_info(reply: &[u8]) -> CellInfo {
    let vals = args::split(reply, "sssss");
    let field = |i: usize| vals.get(i).and_then(Val::as_bytes).unwrap_or(b"");
    CellInfo {
        mcc: after_colon_int(field(0)).unwrap_or(-1),
        mnc: after_colon_int(field(1)).unwrap_or(-1),
        lac: after_colon_text(field(2), 4),
        ci: after_colon_text(field(3), 4),
        bsic: after_colon_text(field(4), 2),
    }
}

fn after_colon(field: &[u8]) -> Option<&[u8]> {
    let pos = field.iter().position(|&c| c == b':')?;
    Some(&field[pos + 1..])
}

fn after_colon_int(field: &[u8]) -> Option<i32> {
    let rest = after_colon(field)?;
    let mut v: i32 = 0;
    let mut any = false;
    for &c in rest {
        match c {
            b'0'..=b'9' => {
                v = v.wrapping_mul(10).wrapping_add(i32::from(c - b'0'));
                any = true;
            }
            b' ' => {}
            _ => break,
        }
    }
    any.then_some(v)
}

fn after_colon_text(field: &[u8], max: usize) -> String {
    let rest = after_colon(field).unwrap_or(b"");
    let rest: &[u8] = rest.strip_prefix(b" ").unwrap_or(rest);
    capped(rest, max)
}

fn capped(bytes: &[u8], max: usize) -> String {
    let take = bytes.len().min(max);
    String::from_utf8_lossy(&bytes[..take]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_parse() {
        let ts = Timestamp::parse("21/03/23,10:31:42+04").unwrap();
        assert_eq!(ts.year, 2021);
        assert_eq!(ts.month, 3);
        assert_eq!(ts.day, 23);
        assert_eq!(ts.hour, 10);
        assert_eq!(ts.minute, 31);
        assert_eq!(ts.second, 42);
        assert_eq!(ts.tz_minutes, 60);

        let ts = Timestamp::parse("99/12/31,23:59:59-08").unwrap();
        assert_eq!(ts.year, 2099);
        assert_eq!(ts.tz_minutes, -120);

        assert!(Timestamp::parse("21/03/23").is_none());
        assert!(Timestamp::parse("21/03/23,10:31:42x04").is_none());
    }

    #[test]
    fn test_parse_operators() {
        let reply = b"(2,\"vodafone IT\",\"voda IT\",\"22210\"),(1,\"WIND TELECOM SPA\",\"WIND\",\"22288\"),,(0,1,2,3,4),(0,1,2)";
        let ops = parse_operators(reply);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, 2);
        assert_eq!(ops[0].long_name, "vodafone IT");
        assert_eq!(ops[0].short_name, "voda IT");
        assert_eq!(ops[0].code, "22210");
        assert_eq!(ops[1].long_name, "WIND TELECOM SPA");
    }

    #[test]
    fn test_parse_operators_caps_names() {
        let reply = b"(1,\"AN OPERATOR WITH A VERY LONG NAME\",\"SHORTNAMETOOLONG\",\"1234567890\")";
        let ops = parse_operators(reply);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].long_name.len(), MAX_OP_LONG);
        assert_eq!(ops[0].short_name.len(), MAX_OP_SHORT);
        assert_eq!(ops[0].code.len(), MAX_OP_CODE);
    }

    #[test]
    fn test_parse_cell_info() {
        let reply = b"MCC:222, MNC:10, LAC:4bf7, CI:952a, BSIC:25";
        let info = parse_cell_info(reply);
        assert_eq!(info.mcc, 222);
        assert_eq!(info.mnc, 10);
        assert_eq!(info.lac, "4bf7");
        assert_eq!(info.ci, "952a");
        assert_eq!(info.bsic, "25");
    }

    #[test]
    fn test_parse_cell_info_missing_fields() {
        let info = parse_cell_info(b"garbage");
        assert_eq!(info.mcc, -1);
        assert_eq!(info.mnc, -1);
        assert!(info.lac.is_empty());
    }

    #[test]
    fn test_raw_first_line() {
        assert_eq!(raw_first_line(b"004999010640000\r\n", 16), "004999010640000");
        assert_eq!(raw_first_line(b"0049990106400001234\r\n", 16), "0049990106400001");
        assert_eq!(raw_first_line(b"bare", 16), "bare");
    }
}
