use super::*;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till},
    character::complete::char,
    combinator::{all_consuming, map, rest},
    multi::many0,
    sequence::preceded,
    IResult, Parser,
};

/// One line of the filter protocol, parsed but not yet acted on.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// `config|...` lines sent by the server before and at the handshake.
    Config(ConfigLine),
    /// `report|...` lines. Reports are never answered.
    Report(Report),
    /// `filter|...` lines. Every one of them expects exactly one verdict.
    Filter(FilterRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigLine {
    /// `config|ready`, the end of the configuration block.
    Ready,
    /// `config|<key>|<value>`, e.g. `config|smtpd-version|7.4.0`.
    Item { key: String, value: String },
}

/// The fields shared by report and filter records.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub protocol: String,
    pub timestamp: String,
    pub subsystem: String,
    pub phase: String,
    pub session: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub envelope: Envelope,
    /// Everything after the session identifier, as received.
    pub params: Vec<String>,
    pub event: ReportEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent {
    /// `smtp-in|tx-mail`: the server decided on a MAIL FROM.
    TxMail(TxMail),
    /// `smtp-in|link-disconnect`: the client went away.
    LinkDisconnect,
    /// Any report this crate has no typed form for.
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxMail {
    pub message_id: String,
    pub result: TxResult,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxResult {
    Ok,
    PermFail,
    TempFail,
    Other(String),
}

impl TxResult {
    fn parse(value: &str) -> Self {
        match value {
            "ok" => TxResult::Ok,
            "permfail" => TxResult::PermFail,
            "tempfail" => TxResult::TempFail,
            other => TxResult::Other(other.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, TxResult::Ok)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterRequest {
    pub envelope: Envelope,
    /// Opaque request identifier, echoed back in the verdict.
    pub token: String,
    pub params: Vec<String>,
    pub event: FilterEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterEvent {
    /// `smtp-in|rcpt-to`. The recipient is absent if the server sent none.
    RcptTo { recipient: Option<String> },
    Other,
}

const SMTP_IN: &str = "smtp-in";

/// Parses a single protocol line, without its trailing newline.
pub fn parse_record(input: &str) -> Result<Record, FilterError> {
    all_consuming(record)
        .parse(input)
        .map(|(_, record)| record)
        .map_err(|e| FilterError::Malformed {
            message: e.to_string(),
            span: (0, input.len()).into(),
        })
}

fn record(input: &str) -> IResult<&str, Record> {
    alt((
        map(preceded(tag("config|"), config_line), Record::Config),
        map(preceded(tag("report|"), (envelope, params)), |(envelope, params)| {
            Record::Report(Report::new(envelope, params))
        }),
        map(
            preceded(tag("filter|"), (envelope, next_field, params)),
            |(envelope, token, params)| {
                Record::Filter(FilterRequest::new(envelope, token.to_string(), params))
            },
        ),
    ))
    .parse(input)
}

fn config_line(input: &str) -> IResult<&str, ConfigLine> {
    alt((
        map(all_consuming(tag("ready")), |_| ConfigLine::Ready),
        map((field, preceded(char('|'), rest)), |(key, value): (&str, &str)| {
            ConfigLine::Item {
                key: key.to_string(),
                value: value.to_string(),
            }
        }),
    ))
    .parse(input)
}

fn envelope(input: &str) -> IResult<&str, Envelope> {
    map(
        (field, next_field, next_field, next_field, next_field),
        |(protocol, timestamp, subsystem, phase, session)| Envelope {
            protocol: protocol.to_string(),
            timestamp: timestamp.to_string(),
            subsystem: subsystem.to_string(),
            phase: phase.to_string(),
            session: session.to_string(),
        },
    )
    .parse(input)
}

fn params(input: &str) -> IResult<&str, Vec<String>> {
    many0(map(next_field, str::to_string)).parse(input)
}

fn next_field(input: &str) -> IResult<&str, &str> {
    preceded(char('|'), field).parse(input)
}

/// A possibly empty run of characters up to the next delimiter.
fn field(input: &str) -> IResult<&str, &str> {
    take_till(|c: char| c == '|').parse(input)
}

impl Report {
    fn new(envelope: Envelope, params: Vec<String>) -> Self {
        let event = match (envelope.subsystem.as_str(), envelope.phase.as_str()) {
            (SMTP_IN, "tx-mail") => match params.as_slice() {
                [message_id, result, address, ..] => ReportEvent::TxMail(TxMail {
                    message_id: message_id.clone(),
                    result: TxResult::parse(result),
                    address: address.clone(),
                }),
                _ => ReportEvent::Other,
            },
            (SMTP_IN, "link-disconnect") => ReportEvent::LinkDisconnect,
            _ => ReportEvent::Other,
        };

        Report {
            envelope,
            params,
            event,
        }
    }
}

impl FilterRequest {
    fn new(envelope: Envelope, token: String, params: Vec<String>) -> Self {
        let event = match (envelope.subsystem.as_str(), envelope.phase.as_str()) {
            (SMTP_IN, "rcpt-to") => FilterEvent::RcptTo {
                recipient: params.first().cloned(),
            },
            _ => FilterEvent::Other,
        };

        FilterRequest {
            envelope,
            token,
            params,
            event,
        }
    }
}
