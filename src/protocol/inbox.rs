//! Parsing of received-message listings.
//!
//! Two shapes come back from the module:
//!
//! ```text
//! +CMTI: "SM",3                                   <- unsolicited "new message stored" notice
//! +CMGL: 3,"REC UNREAD","+237699999999","","24/05/01,10:15:02+04"
//! BAT:78;POS:3.8480,11.5021                       <- body line(s)
//! OK
//! ```
//!
//! Every `+CMGL` header with its body is one message. Only the last line of
//! the listing is taken as the result code, so a body reading `OK` or
//! `ERROR` stays message text. A `+CMTI` notice whose
//! index was not part of the listing is reported on its own, with the notice as
//! content, so nothing the module announced is dropped.

use serde::{Deserialize, Serialize};

use super::commands::is_result_code;

const CMGL: &str = "+CMGL:";
const CMTI: &str = "+CMTI:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboundKind {
    /// Full message from an `AT+CMGL` listing
    Listed,
    /// Bare `+CMTI` notification
    Notification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub kind: InboundKind,
    /// Storage index on the module's SIM/memory
    pub index: Option<u32>,
    pub status: Option<String>,
    pub sender: Option<String>,
    /// Module service-centre timestamp, as sent (`yy/MM/dd,hh:mm:ss±zz`)
    pub sent_at: Option<String>,
    pub content: String,
}

/// Extract every message announced or listed in `raw`.
pub fn parse_inbox(raw: &str) -> Vec<InboundMessage> {
    let mut listed: Vec<InboundMessage> = Vec::new();
    let mut notices: Vec<InboundMessage> = Vec::new();
    let mut current: Option<(InboundMessage, Vec<String>)> = None;

    let lines: Vec<&str> = raw
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let body_end = match lines.last() {
        Some(last) if is_result_code(last) => lines.len() - 1,
        _ => lines.len(),
    };

    for &line in &lines[..body_end] {
        if let Some(rest) = line.strip_prefix(CMGL) {
            if let Some((msg, body)) = current.take() {
                listed.push(finish(msg, body));
            }
            current = Some((parse_header(rest), Vec::new()));
        } else if let Some(rest) = line.strip_prefix(CMTI) {
            if let Some((msg, body)) = current.take() {
                listed.push(finish(msg, body));
            }
            notices.push(parse_notice(line, rest));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line.to_string());
        }
    }
    if let Some((msg, body)) = current.take() {
        listed.push(finish(msg, body));
    }

    let listed_indices: Vec<u32> = listed.iter().filter_map(|m| m.index).collect();
    notices.retain(|n| n.index.map_or(true, |i| !listed_indices.contains(&i)));
    listed.extend(notices);
    listed
}

fn finish(mut msg: InboundMessage, body: Vec<String>) -> InboundMessage {
    msg.content = body.join("\n");
    msg
}

fn parse_header(rest: &str) -> InboundMessage {
    let fields = split_fields(rest);
    let field = |i: usize| fields.get(i).filter(|f| !f.is_empty()).cloned();
    InboundMessage {
        kind: InboundKind::Listed,
        index: fields.first().and_then(|f| f.parse().ok()),
        status: field(1),
        sender: field(2),
        sent_at: field(4),
        content: String::new(),
    }
}

fn parse_notice(line: &str, rest: &str) -> InboundMessage {
    let fields = split_fields(rest);
    InboundMessage {
        kind: InboundKind::Notification,
        index: fields.get(1).and_then(|f| f.parse().ok()),
        status: None,
        sender: None,
        sent_at: None,
        content: line.to_string(),
    }
}

/// Split a comma separated AT parameter list, honouring double quotes.
fn split_fields(s: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in s.trim().chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            c => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}
