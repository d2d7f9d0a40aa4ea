//! Unsolicited result code handling and the shared network state it feeds.
//!
//! URCs arrive at any moment, including between the header and terminal of
//! a pending command response. The dispatcher is table-driven off the
//! command descriptors and has side effects only: it mutates registration
//! state under the net lock, bumps the pending-SMS counter, and wakes
//! socket waiters. Ordering is FIFO by arrival; once applied, any client
//! reading the affected field sees the delivered value.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::at::args::{self, Val};
use crate::cmd::{CmdDesc, CmdId};
use crate::driver::Shared;

/// Network registration state, ordered so that `>= Ok` means registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RegStatus {
    #[default]
    Not,
    Unknown,
    Searching,
    Denied,
    Ok,
    Roaming,
}

impl RegStatus {
    /// Map the wire `<stat>` value of `+CREG`/`+CGREG`.
    fn from_stat(stat: i64) -> RegStatus {
        match stat {
            1 => RegStatus::Ok,
            2 => RegStatus::Searching,
            3 => RegStatus::Denied,
            4 => RegStatus::Unknown,
            5 => RegStatus::Roaming,
            _ => RegStatus::Not,
        }
    }

    pub fn is_registered(self) -> bool {
        self >= RegStatus::Ok
    }
}

/// Radio access technology bits.
pub const RAT_GSM: u8 = 0x01;
pub const RAT_GPRS: u8 = 0x02;

const MAX_LAC_LEN: usize = 4;
const MAX_CI_LEN: usize = 4;

/// Parsed network state, mutated by URCs and `+CREG?`/`+CGREG?` queries.
#[derive(Debug, Default, Clone)]
pub(crate) struct NetStatus {
    pub gsm: RegStatus,
    pub gprs: RegStatus,
    /// Summary: the GPRS status when GPRS is present, `Not` otherwise.
    pub registered: RegStatus,
    /// Packet-data attachment, set by `+UUPSDA` or `+UPSND` polling.
    pub attached: bool,
    /// Signal level as reported by `+CIEV` indicator 2 (0..=5).
    pub rssi_level: u8,
    /// Data-attachment indicator from `+CIEV` indicator 9.
    pub gprs_indicator: bool,
    /// Combined technology bits (`RAT_GSM` | `RAT_GPRS`).
    pub tech: u8,
    pub lac: String,
    pub ci: String,
    pub bsic: String,
    /// Label from `+URAT?` (`GSM` when unsupported).
    pub rat: String,
}

impl NetStatus {
    /// Recompute the technology bits and registration summary, updating
    /// the cell identifiers when present.
    pub fn update(&mut self, lac: Option<&[u8]>, ci: Option<&[u8]>) {
        self.tech = 0;
        if self.gprs.is_registered() {
            self.tech |= RAT_GPRS;
        }
        if self.gsm.is_registered() {
            self.tech |= RAT_GSM;
        }

        if self.tech == 0 {
            self.lac.clear();
            self.ci.clear();
        } else if let (Some(lac), Some(ci)) = (lac, ci) {
            if !lac.is_empty() && !ci.is_empty() {
                self.lac = text_capped(lac, MAX_LAC_LEN);
                self.ci = text_capped(ci, MAX_CI_LEN);
            }
        }

        self.registered = if self.tech & RAT_GPRS != 0 {
            self.gprs
        } else {
            RegStatus::Not
        };
    }
}

fn text_capped(bytes: &[u8], max: usize) -> String {
    let take = bytes.len().min(max);
    String::from_utf8_lossy(&bytes[..take]).into_owned()
}

/// Apply one URC. Called only from the reader thread.
pub(crate) fn dispatch(sh: &Shared, cmd: &CmdDesc, payload: &[u8]) {
    match cmd.id {
        CmdId::Cmti => {
            sh.pending_sms.fetch_add(1, Ordering::Relaxed);
        }
        CmdId::Ciev => {
            let vals = args::split(payload, "ii");
            let (Some(ind), Some(value)) = (first_int(&vals, 0), first_int(&vals, 1)) else {
                warn!("malformed +CIEV: {}", String::from_utf8_lossy(payload));
                return;
            };
            let mut net = sh.net.lock().unwrap();
            match ind {
                2 => net.rssi_level = value.clamp(0, 5) as u8,
                3 => {
                    net.registered = if value != 0 {
                        RegStatus::Ok
                    } else {
                        RegStatus::Not
                    }
                }
                9 => net.gprs_indicator = value != 0,
                other => debug!("unhandled +CIEV indicator {other}"),
            }
        }
        CmdId::Creg => apply_creg(sh, payload, true),
        CmdId::Cgreg => apply_cgreg(sh, payload, true),
        CmdId::Uupsda => {
            let attached = matches!(args::split(payload, "i").first(), Some(Val::Int(0)));
            sh.net.lock().unwrap().attached = attached;
        }
        CmdId::Uupsdd => {
            sh.net.lock().unwrap().attached = false;
        }
        CmdId::Uusocl => {
            if let Some(id) = first_int(&args::split(payload, "i"), 0) {
                sh.socket_closing(id as usize);
            }
        }
        CmdId::Uusord | CmdId::Uusorf => {
            let vals = args::split(payload, "ii");
            if vals.len() < 2 {
                warn!("malformed {}: {}", cmd.body, String::from_utf8_lossy(payload));
                return;
            }
            if let Some(id) = first_int(&vals, 0) {
                sh.socket_pending(id as usize);
            }
        }
        CmdId::Uusoli => {
            // Listening sockets are not offered; log and move on.
            debug!("+UUSOLI: {}", String::from_utf8_lossy(payload));
        }
        other => warn!("unhandled URC {other:?}"),
    }
}

fn first_int(vals: &[Val<'_>], idx: usize) -> Option<i64> {
    vals.get(idx).and_then(Val::as_int)
}

/// Update GSM registration from a `+CREG` payload. Query responses carry a
/// leading `<n>` mode field that URCs do not; LAC and CI are optional in
/// both forms.
pub(crate) fn apply_creg(sh: &Shared, payload: &[u8], from_urc: bool) {
    let Some((stat, lac, ci)) = reg_fields(payload, from_urc) else {
        warn!("malformed +CREG: {}", String::from_utf8_lossy(payload));
        return;
    };
    let mut net = sh.net.lock().unwrap();
    net.gsm = RegStatus::from_stat(stat);
    net.update(lac, ci);
}

/// Update GPRS registration from a `+CGREG` payload.
pub(crate) fn apply_cgreg(sh: &Shared, payload: &[u8], from_urc: bool) {
    let Some((stat, lac, ci)) = reg_fields(payload, from_urc) else {
        warn!("malformed +CGREG: {}", String::from_utf8_lossy(payload));
        return;
    };
    let mut net = sh.net.lock().unwrap();
    net.gprs = RegStatus::from_stat(stat);
    net.update(lac, ci);
}

type RegFields<'a> = (i64, Option<&'a [u8]>, Option<&'a [u8]>);

fn reg_fields(payload: &[u8], from_urc: bool) -> Option<RegFields<'_>> {
    let fmt = if from_urc { "iSS" } else { "iiSS" };
    let vals = args::split(payload, fmt);
    let base = usize::from(!from_urc);
    let stat = first_int(&vals, base)?;
    let lac = vals.get(base + 1).and_then(Val::as_bytes);
    let ci = vals.get(base + 2).and_then(Val::as_bytes);
    Some((stat, lac, ci))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_mapping() {
        assert_eq!(RegStatus::from_stat(0), RegStatus::Not);
        assert_eq!(RegStatus::from_stat(1), RegStatus::Ok);
        assert_eq!(RegStatus::from_stat(2), RegStatus::Searching);
        assert_eq!(RegStatus::from_stat(3), RegStatus::Denied);
        assert_eq!(RegStatus::from_stat(4), RegStatus::Unknown);
        assert_eq!(RegStatus::from_stat(5), RegStatus::Roaming);
        assert!(RegStatus::Roaming.is_registered());
        assert!(!RegStatus::Searching.is_registered());
    }

    #[test]
    fn test_update_prefers_gprs() {
        let mut net = NetStatus::default();
        net.gsm = RegStatus::Ok;
        net.gprs = RegStatus::Roaming;
        net.update(Some(b"12AB"), Some(b"34CD"));
        assert_eq!(net.tech, RAT_GSM | RAT_GPRS);
        assert_eq!(net.registered, RegStatus::Roaming);
        assert_eq!(net.lac, "12AB");
        assert_eq!(net.ci, "34CD");
    }

    #[test]
    fn test_update_gsm_only_is_not_data_registered() {
        let mut net = NetStatus::default();
        net.gsm = RegStatus::Ok;
        net.gprs = RegStatus::Searching;
        net.update(None, None);
        assert_eq!(net.tech, RAT_GSM);
        assert_eq!(net.registered, RegStatus::Not);
    }

    #[test]
    fn test_update_clears_cell_ids_when_unregistered() {
        let mut net = NetStatus {
            lac: "12AB".into(),
            ci: "34CD".into(),
            ..NetStatus::default()
        };
        net.update(None, None);
        assert!(net.lac.is_empty());
        assert!(net.ci.is_empty());
    }

    #[test]
    fn test_reg_fields_urc_and_query_forms() {
        // URC form: <stat>[,<lac>,<ci>]
        let (stat, lac, ci) = reg_fields(b"1,\"00C3\",\"A1B2\"", true).unwrap();
        assert_eq!(stat, 1);
        assert_eq!(lac, Some(&b"00C3"[..]));
        assert_eq!(ci, Some(&b"A1B2"[..]));

        // Query form: <n>,<stat>[,<lac>,<ci>]
        let (stat, lac, ci) = reg_fields(b"2,5", false).unwrap();
        assert_eq!(stat, 5);
        assert_eq!(lac, None);
        assert_eq!(ci, None);

        // Absent optional fields never fault.
        let (stat, lac, _) = reg_fields(b"3", true).unwrap();
        assert_eq!(stat, 3);
        assert_eq!(lac, None);
    }
}
