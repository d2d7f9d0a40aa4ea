//! SMS send, list, delete and service-center address handling.
//!
//! The modem runs in text mode (`+CMGF=1`, set at startup). Sending goes
//! through the `>` prompt: the body is streamed as a raw payload and
//! terminated with Ctrl-Z. Listing is reader-driven — each `+CMGL:` header
//! line opens a record and the following raw line carries the body.

use std::sync::atomic::Ordering;

use crate::at::args;
use crate::at::writer::Arg;
use crate::cmd::CmdId;
use crate::driver::{Driver, Prompt, Request};
use crate::error::{Error, ParseError, Result};
use crate::net::Timestamp;
use crate::slot::SmsCapture;

const MAX_SCA_LEN: usize = 32;

/// One stored message from a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsRecord {
    /// Storage index, usable with [`Driver::sms_delete`].
    pub index: i32,
    pub unread: bool,
    /// Originating address.
    pub origin: String,
    /// Service-center timestamp, verbatim.
    pub timestamp: String,
    pub text: String,
}

impl SmsRecord {
    /// Decode the service-center timestamp.
    pub fn timestamp_parsed(&self) -> Option<Timestamp> {
        Timestamp::parse(&self.timestamp)
    }
}

impl Driver {
    /// Send a text message. Returns the message reference the network
    /// assigned.
    pub async fn sms_send(&self, number: &str, text: &str) -> Result<i32> {
        let done = self
            .exchange(
                Request::new(CmdId::Cmgs, "=%\"s", &[Arg::Str(number.as_bytes())])
                    .reply(64, 1)
                    .timeout(self.t(120))
                    .prompt(Prompt {
                        payload: text.as_bytes(),
                        trailer: b"\x1a",
                    }),
            )
            .await?;
        let vals = args::require(&done.reply, "i")?;
        Ok(vals[0].as_int().ok_or(Error::Parse(ParseError::Args))? as i32)
    }

    /// List stored messages. `offset` skips records with a lower storage
    /// index; at most `max` records are returned. Resets the pending-SMS
    /// counter.
    pub async fn sms_list(
        &self,
        unread_only: bool,
        max: usize,
        offset: i32,
    ) -> Result<Vec<SmsRecord>> {
        self.shared().pending_sms.store(0, Ordering::Relaxed);
        let filter: &[u8] = if unread_only { b"REC UNREAD" } else { b"ALL" };
        let done = self
            .exchange(
                Request::new(CmdId::Cmgl, "=%\"s", &[Arg::Str(filter)])
                    .reply(64, 1)
                    .timeout(self.t(60))
                    .sms(SmsCapture::new(max, offset)),
            )
            .await?;
        Ok(done.sms)
    }

    /// Messages announced by `+CMTI` since the last listing.
    pub fn sms_pending(&self) -> i32 {
        self.shared().pending_sms.load(Ordering::Relaxed)
    }

    /// Delete a stored message by index.
    pub async fn sms_delete(&self, index: i32) -> Result<()> {
        self.exchange(
            Request::new(CmdId::Cmgd, "=%d", &[Arg::Int(i64::from(index))]).timeout(self.t(1)),
        )
        .await?;
        Ok(())
    }

    /// Read the service-center address (`+CSCA?`).
    pub async fn sms_sca(&self) -> Result<String> {
        let done = self
            .exchange(
                Request::new(CmdId::Csca, "?", &[])
                    .reply(64, 1)
                    .timeout(self.t(1)),
            )
            .await?;
        let vals = args::require(&done.reply, "S")?;
        let text = vals[0].to_text().ok_or(Error::Parse(ParseError::Args))?;
        let take = text.len().min(MAX_SCA_LEN);
        Ok(text.get(..take).unwrap_or(&text).to_string())
    }

    /// Set the service-center address.
    pub async fn sms_set_sca(&self, sca: &str) -> Result<()> {
        self.exchange(
            Request::new(CmdId::Csca, "=%\"s", &[Arg::Str(sca.as_bytes())]).timeout(self.t(1)),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_passthrough() {
        let rec = SmsRecord {
            index: 3,
            unread: true,
            origin: "+15551234567".into(),
            timestamp: "21/03/23,10:30:00+04".into(),
            text: "Hello".into(),
        };
        let ts = rec.timestamp_parsed().unwrap();
        assert_eq!(ts.year, 2021);
        assert_eq!(ts.tz_minutes, 60);

        let bad = SmsRecord {
            timestamp: "??".into(),
            ..rec
        };
        assert!(bad.timestamp_parsed().is_none());
    }
}
