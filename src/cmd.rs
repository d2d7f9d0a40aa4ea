//! The command descriptor table.
//!
//! Every AT command and URC the driver understands is one row in a static
//! table sorted by body. The reader classifies incoming lines with a
//! binary search over it instead of hand-written branching; flags say
//! whether a body may appear as a command response, as a URC, or both.

use crate::at::parser::{RspParser, SliceSource};

/// How a command answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Only a terminal result, no information line.
    Final,
    /// One `<body>: <args>` line, then the terminal.
    ParamThenFinal,
    /// Free-form lines up to the terminal, no `<body>:` prefix.
    Raw,
}

/// Command identifiers, one per table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdId {
    Ccid,
    Cclk,
    Cgatt,
    Cged,
    Cgreg,
    Cgsn,
    Ciev,
    Cmee,
    Cmer,
    Cmgd,
    Cmgf,
    Cmgl,
    Cmgs,
    Cmti,
    Cnmi,
    Cops,
    Creg,
    Csca,
    Cscs,
    Echo,
    Gmr,
    Ipr,
    Udconf,
    Udnsrn,
    Upsd,
    Upsda,
    Upsnd,
    Urat,
    Usecmng,
    Usecprf,
    Usocl,
    Usoco,
    Usocr,
    Usoctl,
    Usogo,
    Usoli,
    Usord,
    Usorf,
    Usosec,
    Usoso,
    Usost,
    Usowr,
    Uupsda,
    Uupsdd,
    Uusocl,
    Uusoli,
    Uusord,
    Uusorf,
}

/// One table row.
#[derive(Debug, PartialEq, Eq)]
pub struct CmdDesc {
    pub id: CmdId,
    /// ASCII body as it appears on the wire, without the `AT` prefix.
    pub body: &'static str,
    pub response: ResponseKind,
    /// May appear as a response to a command we sent.
    pub as_response: bool,
    /// May arrive spontaneously.
    pub as_urc: bool,
}

const fn cmd(
    id: CmdId,
    body: &'static str,
    response: ResponseKind,
    as_response: bool,
    as_urc: bool,
) -> CmdDesc {
    CmdDesc {
        id,
        body,
        response,
        as_response,
        as_urc,
    }
}

/// Sorted by `body`; [`lookup`] depends on the order.
pub static COMMANDS: &[CmdDesc] = &[
    cmd(CmdId::Ccid, "+CCID", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Cclk, "+CCLK", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Cgatt, "+CGATT", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Cged, "+CGED", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Cgreg, "+CGREG", ResponseKind::ParamThenFinal, true, true),
    cmd(CmdId::Cgsn, "+CGSN", ResponseKind::Raw, true, false),
    cmd(CmdId::Ciev, "+CIEV", ResponseKind::Raw, true, true),
    cmd(CmdId::Cmee, "+CMEE", ResponseKind::Final, true, false),
    cmd(CmdId::Cmer, "+CMER", ResponseKind::Final, true, false),
    cmd(CmdId::Cmgd, "+CMGD", ResponseKind::Final, true, false),
    cmd(CmdId::Cmgf, "+CMGF", ResponseKind::Final, true, false),
    cmd(CmdId::Cmgl, "+CMGL", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Cmgs, "+CMGS", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Cmti, "+CMTI", ResponseKind::Final, false, true),
    cmd(CmdId::Cnmi, "+CNMI", ResponseKind::Final, true, false),
    cmd(CmdId::Cops, "+COPS", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Creg, "+CREG", ResponseKind::ParamThenFinal, true, true),
    cmd(CmdId::Csca, "+CSCA", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Cscs, "+CSCS", ResponseKind::Final, true, false),
    cmd(CmdId::Gmr, "+GMR", ResponseKind::Raw, true, false),
    cmd(CmdId::Ipr, "+IPR", ResponseKind::Final, true, false),
    cmd(CmdId::Udconf, "+UDCONF", ResponseKind::Final, true, false),
    cmd(CmdId::Udnsrn, "+UDNSRN", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Upsd, "+UPSD", ResponseKind::Final, true, false),
    cmd(CmdId::Upsda, "+UPSDA", ResponseKind::Final, true, false),
    cmd(CmdId::Upsnd, "+UPSND", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Urat, "+URAT", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Usecmng, "+USECMNG", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Usecprf, "+USECPRF", ResponseKind::Final, true, false),
    cmd(CmdId::Usocl, "+USOCL", ResponseKind::Final, true, false),
    cmd(CmdId::Usoco, "+USOCO", ResponseKind::Final, true, false),
    cmd(CmdId::Usocr, "+USOCR", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Usoctl, "+USOCTL", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Usogo, "+USOGO", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Usoli, "+USOLI", ResponseKind::Final, true, false),
    cmd(CmdId::Usord, "+USORD", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Usorf, "+USORF", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Usosec, "+USOSEC", ResponseKind::Final, true, false),
    cmd(CmdId::Usoso, "+USOSO", ResponseKind::Final, true, false),
    cmd(CmdId::Usost, "+USOST", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Usowr, "+USOWR", ResponseKind::ParamThenFinal, true, false),
    cmd(CmdId::Uupsda, "+UUPSDA", ResponseKind::Final, false, true),
    cmd(CmdId::Uupsdd, "+UUPSDD", ResponseKind::Final, false, true),
    cmd(CmdId::Uusocl, "+UUSOCL", ResponseKind::Final, false, true),
    cmd(CmdId::Uusoli, "+UUSOLI", ResponseKind::Final, false, true),
    cmd(CmdId::Uusord, "+UUSORD", ResponseKind::Final, false, true),
    cmd(CmdId::Uusorf, "+UUSORF", ResponseKind::Final, false, true),
    cmd(CmdId::Echo, "E", ResponseKind::Final, true, false),
];

/// Row for a command id.
pub fn get(id: CmdId) -> &'static CmdDesc {
    // The table is tiny; a linear scan keeps it order-independent.
    COMMANDS
        .iter()
        .find(|d| d.id == id)
        .unwrap_or(&COMMANDS[0])
}

/// Classify a line: read the leading command token and binary-search it in
/// the table. The token is the maximal run of `+` and capitals, so bodies
/// sharing a prefix (`+UPSD` / `+UPSDA`) cannot shadow each other.
pub fn lookup(line: &[u8]) -> Option<&'static CmdDesc> {
    let mut p = RspParser::new(SliceSource::new(line));
    let i = p.lookup("+A-Z", COMMANDS, |d| d.body.as_bytes())?;
    Some(&COMMANDS[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted_by_body() {
        for w in COMMANDS.windows(2) {
            assert!(
                w[0].body.as_bytes() < w[1].body.as_bytes(),
                "{} must sort before {}",
                w[0].body,
                w[1].body
            );
        }
    }

    #[test]
    fn test_lookup_exact_and_prefix() {
        assert_eq!(lookup(b"+CREG: 1").map(|d| d.id), Some(CmdId::Creg));
        assert_eq!(lookup(b"+CGREG: 2,1").map(|d| d.id), Some(CmdId::Cgreg));
        assert_eq!(lookup(b"+UUSORF: 0,4").map(|d| d.id), Some(CmdId::Uusorf));
        assert!(lookup(b"OK").is_none());
        assert!(lookup(b"+XYZZY: 1").is_none());
    }

    #[test]
    fn test_lookup_prefers_longest_body() {
        // "+UPSD" prefixes "+UPSDA: 0"; the longer body must win.
        assert_eq!(lookup(b"+UPSDA: 0").map(|d| d.id), Some(CmdId::Upsda));
        assert_eq!(lookup(b"+UPSD: 0,1").map(|d| d.id), Some(CmdId::Upsd));
    }

    #[test]
    fn test_get_by_id() {
        assert_eq!(get(CmdId::Usocr).body, "+USOCR");
        assert_eq!(get(CmdId::Echo).body, "E");
        assert_eq!(get(CmdId::Cmgl).response, ResponseKind::ParamThenFinal);
    }
}
