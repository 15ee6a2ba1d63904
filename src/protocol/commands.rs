//! Wire encoding of the AT commands used by the link, and response token scanning.

/// Ctrl-Z, finalizes a text-mode message.
pub const CTRL_Z: u8 = 0x1A;

pub const TOKEN_OK: &str = "OK";
pub const TOKEN_SENT: &str = "+CMGS:";
pub const TOKEN_ERROR: &str = "ERROR";
pub const TOKEN_PROMPT: char = '>';

/// Storage filter for `AT+CMGL`.
pub const LIST_UNREAD: &str = "REC UNREAD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
    /// `AT` liveness probe
    Probe,
    /// `AT+CMGF=1` switch to text mode
    TextMode,
    /// `AT+CMGS="<number>"` open a message to `number`
    Compose { number: String },
    /// Raw message body
    Body(String),
    /// Ctrl-Z terminator
    Terminator,
    /// `AT+CMGL="<filter>"` list stored messages
    List { filter: String },
}

impl AtCommand {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AtCommand::Probe => b"AT\r".to_vec(),
            AtCommand::TextMode => b"AT+CMGF=1\r".to_vec(),
            AtCommand::Compose { number } => format!("AT+CMGS=\"{}\"\r", number).into_bytes(),
            AtCommand::Body(text) => text.as_bytes().to_vec(),
            AtCommand::Terminator => vec![CTRL_Z],
            AtCommand::List { filter } => format!("AT+CMGL=\"{}\"\r", filter).into_bytes(),
        }
    }

    /// Short label for logs (never includes the message body).
    pub fn label(&self) -> &'static str {
        match self {
            AtCommand::Probe => "AT",
            AtCommand::TextMode => "AT+CMGF=1",
            AtCommand::Compose { .. } => "AT+CMGS",
            AtCommand::Body(_) => "<body>",
            AtCommand::Terminator => "<ctrl-z>",
            AtCommand::List { .. } => "AT+CMGL",
        }
    }
}

/// True when the response carries a success token (`OK` or `+CMGS:`).
pub fn has_success_token(response: &str) -> bool {
    response.contains(TOKEN_OK) || response.contains(TOKEN_SENT)
}

/// True when the module reported an error (`ERROR`, `+CMS ERROR: n`, `+CME ERROR: n`).
pub fn has_error_token(response: &str) -> bool {
    response.contains(TOKEN_ERROR)
}

/// A command is finished once a final result code shows up.
pub fn has_final_result(response: &str) -> bool {
    response.lines().any(|l| {
        let l = l.trim();
        l == TOKEN_OK || l.contains(TOKEN_ERROR)
    })
}

/// `AT+CMGS` is ready for the body once the `>` prompt arrives.
pub fn has_prompt(response: &str) -> bool {
    response.contains(TOKEN_PROMPT) || has_error_token(response)
}

/// True when `line` on its own is a final result code.
pub fn is_result_code(line: &str) -> bool {
    line == TOKEN_OK
        || line == TOKEN_ERROR
        || line.starts_with("+CMS ERROR")
        || line.starts_with("+CME ERROR")
}

/// The final result code closing a multi-line answer: the last non-empty line,
/// when it is one. Earlier lines may carry message text and are not inspected.
pub fn closing_result(response: &str) -> Option<&str> {
    response
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .filter(|l| is_result_code(l))
}

/// Message reference from a `+CMGS: <mr>` line.
pub fn message_reference(response: &str) -> Option<u32> {
    let start = response.find(TOKEN_SENT)? + TOKEN_SENT.len();
    let digits: String = response[start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// First line reporting an error, for error details.
pub fn error_line(response: &str) -> Option<String> {
    response
        .lines()
        .map(str::trim)
        .find(|l| l.contains(TOKEN_ERROR))
        .map(str::to_string)
}
