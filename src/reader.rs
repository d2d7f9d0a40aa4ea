//! The I/O loop — sole reader of the serial stream.
//!
//! A dedicated, named `std::thread` reads one line at a time and classifies
//! it into a typed [`Line`]; slot handling branches only on that enum, so
//! the classifier is a pure function over the line bytes and is fuzzable in
//! isolation. URC lines have side effects only; response lines populate the
//! active slot; terminal lines complete or fail it. A failure to parse a
//! line never stalls the loop beyond the 100 ms line-read poll, and slot
//! deadlines are enforced on every idle poll.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::at::args;
use crate::at::parser::MAX_BUF;
use crate::cmd::{self, CmdDesc, CmdId, ResponseKind};
use crate::driver::Shared;
use crate::slot::{ActiveSlot, Outcome};
use crate::sms::SmsRecord;
use crate::transport::Transport;
use crate::urc;

/// Poll granularity for line reads and slot-deadline checks.
const LINE_POLL: Duration = Duration::from_millis(100);

/// One classified line from the modem.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Line<'a> {
    /// Blank line (`\r\n`).
    Empty,
    /// The `>` prompt requesting a raw payload.
    Prompt,
    /// `<body>: <args>` for a known command or URC.
    Known(&'static CmdDesc, &'a [u8]),
    /// Terminal `OK`.
    TerminalOk,
    /// Terminal `ERROR`/`ABORT` (no message) or `+CME`/`+CMS ERROR` (with one).
    TerminalError(Option<&'a [u8]>),
    /// Anything else, end-of-line stripped.
    Unknown(&'a [u8]),
}

/// Classify one raw line (terminator included, if any).
pub(crate) fn classify(raw: &[u8]) -> Line<'_> {
    let line = strip_eol(raw);
    if line.is_empty() {
        return Line::Empty;
    }
    if line[0] == b'>' && line.len() <= 2 {
        return Line::Prompt;
    }
    if line == b"OK" {
        return Line::TerminalOk;
    }
    if line == b"ERROR" || line == b"ABORT" {
        return Line::TerminalError(None);
    }
    if let Some(msg) = line.strip_prefix(b"+CME ERROR: ") {
        return Line::TerminalError(Some(msg));
    }
    if let Some(msg) = line.strip_prefix(b"+CMS ERROR: ") {
        return Line::TerminalError(Some(msg));
    }
    if let Some(desc) = cmd::lookup(line) {
        let n = desc.body.len();
        if line.len() > n + 1 && line[n] == b':' && line[n + 1] == b' ' {
            return Line::Known(desc, &line[n + 2..]);
        }
    }
    Line::Unknown(line)
}

fn strip_eol(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    &raw[..end]
}

/// Spawn the reader thread. It holds only a weak reference, so it winds
/// down once the last driver handle is dropped.
pub(crate) fn spawn(shared: &Arc<Shared>) -> std::io::Result<std::thread::JoinHandle<()>> {
    let weak = Arc::downgrade(shared);
    std::thread::Builder::new()
        .name("g350-reader".into())
        .spawn(move || run(weak))
}

fn run(weak: Weak<Shared>) {
    debug!("reader loop started");
    let mut acc: Vec<u8> = Vec::with_capacity(MAX_BUF);
    loop {
        let Some(sh) = weak.upgrade() else { break };
        if !sh.talking.load(Ordering::Acquire) {
            sh.running.store(false, Ordering::Release);
            drop(sh);
            std::thread::sleep(LINE_POLL);
            continue;
        }
        sh.running.store(true, Ordering::Release);

        match read_line(&*sh.transport, &mut acc) {
            Some(line) => {
                debug!("rl: {}", String::from_utf8_lossy(&line).trim_end());
                handle_line(&sh, &line);
            }
            None => {
                // A timed-out partial beginning with '>' is the prompt: the
                // modem does not terminate it with an end of line.
                if acc.first() == Some(&b'>') {
                    if fire_prompt(&sh) {
                        debug!("prompt");
                    }
                    acc.clear();
                }
                check_slot_deadline(&sh);
            }
        }
    }
    debug!("reader loop exiting");
}

/// Accumulate bytes until `\n` or the poll deadline. Partial lines stay in
/// `acc` across polls; a line that outgrows the buffer is returned as-is
/// (unterminated) so classification can discard it and the stream
/// resynchronizes at the next terminator.
fn read_line(transport: &dyn Transport, acc: &mut Vec<u8>) -> Option<Vec<u8>> {
    let deadline = Instant::now() + LINE_POLL;
    loop {
        if acc.len() >= MAX_BUF {
            warn!("line exceeds {MAX_BUF} bytes, discarding");
            return Some(std::mem::take(acc));
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        match transport.read_byte(deadline - now) {
            Ok(Some(b)) => {
                acc.push(b);
                if b == b'\n' {
                    return Some(std::mem::take(acc));
                }
            }
            Ok(None) => return None,
            Err(e) => {
                warn!("serial read: {e}");
                return None;
            }
        }
    }
}

fn handle_line(sh: &Shared, raw: &[u8]) {
    match classify(raw) {
        Line::Empty => {}
        Line::Prompt => {
            if !fire_prompt(sh) {
                debug!("stray prompt ignored");
            }
        }
        Line::Known(desc, payload) => handle_known(sh, desc, payload),
        Line::TerminalOk => handle_ok(sh),
        Line::TerminalError(msg) => handle_error(sh, msg),
        Line::Unknown(line) => handle_unknown(sh, line),
    }
}

fn handle_known(sh: &Shared, desc: &'static CmdDesc, payload: &[u8]) {
    let mut guard = sh.slot.lock().unwrap();
    if let Some(slot) = guard.as_mut() {
        if slot.cmd.id == desc.id {
            if slot.sms.is_some() {
                sms_header(slot, payload);
            } else if slot.expected > 0 {
                slot.push_reply(payload);
                slot.lines += 1;
            } else {
                warn!("unexpected params for {}", desc.body);
            }
            return;
        }
    }
    drop(guard);
    if desc.as_urc {
        urc::dispatch(sh, desc, payload);
    } else if desc.as_response {
        warn!("response {} without a matching slot", desc.body);
    }
}

fn handle_ok(sh: &Shared) {
    let mut guard = sh.slot.lock().unwrap();
    let Some(slot) = guard.as_ref() else {
        debug!("stray OK");
        return;
    };
    // The SMS listing produces a variable number of lines.
    if slot.lines == slot.expected || slot.cmd.id == CmdId::Cmgl {
        if let Some(slot) = guard.take() {
            drop(guard);
            debug!("ok slot {}", slot.cmd.body);
            slot.complete(Outcome::Ok);
        }
    } else {
        warn!(
            "unexpected OK for {} ({}/{} lines)",
            slot.cmd.body, slot.lines, slot.expected
        );
    }
}

fn handle_error(sh: &Shared, msg: Option<&[u8]>) {
    let text = msg
        .map(|m| String::from_utf8_lossy(strip_eol(m)).into_owned())
        .unwrap_or_default();
    {
        let mut err = sh.errmsg.lock().unwrap();
        err.clear();
        let cap = text.len().min(32);
        err.push_str(text.get(..cap).unwrap_or(&text));
    }
    let slot = sh.slot.lock().unwrap().take();
    match slot {
        Some(slot) => {
            debug!("error slot {}", slot.cmd.body);
            slot.complete(Outcome::Error(text));
        }
        None => warn!("stray error line"),
    }
}

fn handle_unknown(sh: &Shared, line: &[u8]) {
    let mut guard = sh.slot.lock().unwrap();
    match guard.as_mut() {
        Some(slot) if slot.sms.is_some() => sms_body(slot, line),
        Some(slot) if slot.cmd.response == ResponseKind::Raw => {
            slot.push_reply(line);
            slot.push_reply(b"\r\n");
            slot.lines += 1;
        }
        Some(slot) => warn!("unexpected line for {}", slot.cmd.body),
        None => warn!("unknown line out of slot: {}", String::from_utf8_lossy(line)),
    }
}

fn fire_prompt(sh: &Shared) -> bool {
    let mut guard = sh.slot.lock().unwrap();
    if let Some(slot) = guard.as_mut() {
        // Only prompt-capable commands may enter prompt mode; a stray `>`
        // for anything else is ignored.
        if matches!(slot.cmd.id, CmdId::Usecmng | CmdId::Cmgs) {
            if let Some(tx) = slot.prompt.take() {
                let _ = tx.send(());
                return true;
            }
        }
    }
    false
}

fn check_slot_deadline(sh: &Shared) {
    let now = Instant::now();
    let mut guard = sh.slot.lock().unwrap();
    let expired = guard.as_ref().is_some_and(|slot| slot.expired(now));
    if expired {
        if let Some(slot) = guard.take() {
            drop(guard);
            warn!("slot timeout {}", slot.cmd.body);
            slot.complete(Outcome::Timeout);
        }
    }
}

const MAX_SMS_OADDR_LEN: usize = 16;
const MAX_SMS_TS_LEN: usize = 24;
const MAX_SMS_TXT_LEN: usize = 160;

/// Handle a `+CMGL:` header line: `<index>,<stat>,<oa>,[<alpha>],<scts>`.
/// Applies the listing's filter (status, capacity, index offset) and opens
/// a record whose text the following raw line fills in.
fn sms_header(slot: &mut ActiveSlot, payload: &[u8]) {
    let Some(cap) = slot.sms.as_mut() else { return };
    let vals = args::split(payload, "issss");
    if vals.len() != 5 {
        warn!("malformed +CMGL header");
        return;
    }
    let (Some(index), Some(stat), Some(oa), Some(scts)) = (
        vals[0].as_int(),
        vals[1].as_bytes(),
        vals[2].as_bytes(),
        vals[4].as_bytes(),
    ) else {
        return;
    };

    // Only stored-message records ("REC READ"/"REC UNREAD") are listed.
    if !stat.ends_with(b"READ\"") {
        cap.skip = true;
        return;
    }
    if cap.records.len() >= cap.max || i64::from(cap.offset) > index {
        cap.skip = true;
        return;
    }
    cap.skip = false;
    cap.records.push(SmsRecord {
        index: index as i32,
        unread: stat.get(5) == Some(&b'U'),
        origin: capped_text(args::strip_quotes(oa), MAX_SMS_OADDR_LEN),
        timestamp: capped_text(args::strip_quotes(scts), MAX_SMS_TS_LEN),
        text: String::new(),
    });
}

/// A raw line during an SMS listing is the body of the record the last
/// header opened.
fn sms_body(slot: &mut ActiveSlot, line: &[u8]) {
    let Some(cap) = slot.sms.as_mut() else { return };
    if cap.skip {
        return;
    }
    if let Some(rec) = cap.records.last_mut() {
        rec.text = capped_text(line, MAX_SMS_TXT_LEN);
    }
}

fn capped_text(bytes: &[u8], max: usize) -> String {
    let take = bytes.len().min(max);
    String::from_utf8_lossy(&bytes[..take]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_empty_and_prompt() {
        assert_eq!(classify(b"\r\n"), Line::Empty);
        assert_eq!(classify(b""), Line::Empty);
        assert_eq!(classify(b"> "), Line::Prompt);
        assert_eq!(classify(b">"), Line::Prompt);
    }

    #[test]
    fn test_classify_terminals() {
        assert_eq!(classify(b"OK\r\n"), Line::TerminalOk);
        assert_eq!(classify(b"ERROR\r\n"), Line::TerminalError(None));
        assert_eq!(classify(b"ABORT\r\n"), Line::TerminalError(None));
        assert_eq!(
            classify(b"+CME ERROR: operation not allowed\r\n"),
            Line::TerminalError(Some(b"operation not allowed"))
        );
        assert_eq!(
            classify(b"+CMS ERROR: 321\r\n"),
            Line::TerminalError(Some(b"321"))
        );
    }

    #[test]
    fn test_classify_known_lines() {
        match classify(b"+CREG: 1,\"00C3\",\"A1B2\"\r\n") {
            Line::Known(desc, payload) => {
                assert_eq!(desc.id, CmdId::Creg);
                assert_eq!(payload, b"1,\"00C3\",\"A1B2\"");
            }
            other => panic!("unexpected {other:?}"),
        }
        match classify(b"+UUSORF: 0,4\r\n") {
            Line::Known(desc, _) => assert_eq!(desc.id, CmdId::Uusorf),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_body_without_separator_is_unknown() {
        // A known body not followed by ": " is not a command response.
        assert_eq!(classify(b"+CREG?\r\n"), Line::Unknown(b"+CREG?"));
        assert_eq!(
            classify(b"004999010640000\r\n"),
            Line::Unknown(b"004999010640000")
        );
    }

    #[test]
    fn test_classify_oversized_garbage() {
        let raw = vec![b'x'; MAX_BUF];
        match classify(&raw) {
            Line::Unknown(line) => assert_eq!(line.len(), MAX_BUF),
            other => panic!("unexpected {other:?}"),
        }
    }
}
