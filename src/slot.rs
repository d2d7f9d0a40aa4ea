//! The exclusive command slot.
//!
//! A slot is the driver's reservation to issue one AT command and receive
//! its response. Exactly one exists per driver: the async `order` mutex
//! serializes would-be owners, and the `active` cell shares the in-flight
//! exchange with the reader thread. The owner's sequence is fixed:
//! install the slot, send the command, await the completion channel, parse
//! the reply, drop the gate guard. The reader completes a slot by taking
//! it out of the cell and firing the one-shot sender, which hands the
//! reply buffer back to the owner — nothing is shared after completion.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::cmd::CmdDesc;
use crate::sms::SmsRecord;

/// How an exchange ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Terminal `OK` seen with the expected parameter lines.
    Ok,
    /// `ERROR` / `+CME ERROR` / `+CMS ERROR`; the message text if any.
    Error(String),
    /// The deadline elapsed before a terminal line.
    Timeout,
}

/// Everything the reader hands back on completion.
#[derive(Debug)]
pub(crate) struct SlotDone {
    pub outcome: Outcome,
    /// Accumulated parameter-line payloads (or raw lines).
    pub reply: Vec<u8>,
    /// Parameter lines observed.
    pub lines: u32,
    /// Records captured for an SMS listing, empty otherwise.
    pub sms: Vec<SmsRecord>,
}

/// Reader-side state for an SMS listing in progress.
#[derive(Debug)]
pub(crate) struct SmsCapture {
    /// Stop storing once this many records are captured.
    pub max: usize,
    /// Ignore records with a lower index.
    pub offset: i32,
    /// The body line following a skipped header is dropped too.
    pub skip: bool,
    pub records: Vec<SmsRecord>,
}

impl SmsCapture {
    pub fn new(max: usize, offset: i32) -> Self {
        SmsCapture {
            max,
            offset,
            skip: true,
            records: Vec::new(),
        }
    }
}

/// The in-flight exchange, owned by the `active` cell while pending.
pub(crate) struct ActiveSlot {
    pub cmd: &'static CmdDesc,
    pub started: Instant,
    /// Zero means no deadline.
    pub timeout: Duration,
    /// Parameter lines the command must produce before `OK` completes it.
    pub expected: u32,
    pub lines: u32,
    /// Reply bytes are capped at this size; excess is dropped.
    pub max_size: usize,
    pub reply: Vec<u8>,
    pub done: Option<oneshot::Sender<SlotDone>>,
    /// One-shot prompt-ready signal, installed only for prompt-capable
    /// commands. The reader fires it when it consumes `>`.
    pub prompt: Option<oneshot::Sender<()>>,
    pub sms: Option<SmsCapture>,
}

impl ActiveSlot {
    pub fn new(
        cmd: &'static CmdDesc,
        max_size: usize,
        timeout: Duration,
        expected: u32,
    ) -> (Self, oneshot::Receiver<SlotDone>) {
        let (done_tx, done_rx) = oneshot::channel();
        (
            ActiveSlot {
                cmd,
                started: Instant::now(),
                timeout,
                expected,
                lines: 0,
                max_size,
                reply: Vec::new(),
                done: Some(done_tx),
                prompt: None,
                sms: None,
            },
            done_rx,
        )
    }

    /// Append payload bytes up to the reply cap.
    pub fn push_reply(&mut self, bytes: &[u8]) {
        let room = self.max_size.saturating_sub(self.reply.len());
        let take = bytes.len().min(room);
        self.reply.extend_from_slice(&bytes[..take]);
    }

    pub fn expired(&self, now: Instant) -> bool {
        !self.timeout.is_zero() && now.duration_since(self.started) > self.timeout
    }

    /// Fire the completion channel, consuming the slot.
    pub fn complete(mut self, outcome: Outcome) {
        let sms = self.sms.take().map(|c| c.records).unwrap_or_default();
        if let Some(tx) = self.done.take() {
            let _ = tx.send(SlotDone {
                outcome,
                reply: std::mem::take(&mut self.reply),
                lines: self.lines,
                sms,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{self, CmdId};

    #[test]
    fn test_reply_is_capped() {
        let (mut slot, _rx) = ActiveSlot::new(cmd::get(CmdId::Usord), 4, Duration::ZERO, 1);
        slot.push_reply(b"0,32,\"AB\"");
        assert_eq!(slot.reply, b"0,32");
    }

    #[test]
    fn test_expiry() {
        let (mut slot, _rx) =
            ActiveSlot::new(cmd::get(CmdId::Creg), 0, Duration::from_millis(5), 0);
        slot.started = Instant::now() - Duration::from_millis(10);
        assert!(slot.expired(Instant::now()));
        // Zero timeout never expires.
        slot.timeout = Duration::ZERO;
        assert!(!slot.expired(Instant::now()));
    }

    #[test]
    fn test_complete_delivers_reply() {
        let (mut slot, mut rx) = ActiveSlot::new(cmd::get(CmdId::Udnsrn), 64, Duration::ZERO, 1);
        slot.push_reply(b"\"93.184.216.34\"");
        slot.lines = 1;
        slot.complete(Outcome::Ok);
        let done = rx.try_recv().unwrap();
        assert!(matches!(done.outcome, Outcome::Ok));
        assert_eq!(done.reply, b"\"93.184.216.34\"");
        assert_eq!(done.lines, 1);
    }
}
