//! SMTP reply handling

use crate::smtp::error::SmtpLimits;

/// An SMTP reply that can be sent to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Three digit reply code
    pub code: u16,
    /// First (or only) line of text
    pub message: String,
    /// Further lines, as in the EHLO capability list
    pub multiline: Option<Vec<String>>,
}

impl SmtpResponse {
    pub fn new(code: u16, message: &str) -> Self {
        Self {
            code,
            message: message.to_owned(),
            multiline: None,
        }
    }

    pub fn new_multiline(code: u16, message: &str, lines: Vec<String>) -> Self {
        Self {
            code,
            message: message.to_owned(),
            multiline: Some(lines),
        }
    }

    /// 250 OK
    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    /// 220 service ready
    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, &format!("{hostname} ESMTP Service Ready"))
    }

    pub fn helo(hostname: &str, client_domain: &str) -> Self {
        Self::new(250, &format!("{hostname} Hello {client_domain}"))
    }

    /// 250 with the capability list
    pub fn ehlo(hostname: &str, client_domain: &str, capabilities: Vec<String>) -> Self {
        Self::new_multiline(
            250,
            &format!("{hostname} Hello {client_domain}"),
            capabilities,
        )
    }

    pub fn data_start() -> Self {
        Self::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    /// 250 after a message was stored
    pub fn queued(id: &str) -> Self {
        Self::new(250, &format!("OK: queued as {id}"))
    }

    /// 334 continuation during AUTH; `challenge` is already base64
    pub fn auth_challenge(challenge: &str) -> Self {
        Self::new(334, challenge)
    }

    pub fn auth_success() -> Self {
        Self::new(235, "Authentication succeeded")
    }

    pub fn cannot_verify() -> Self {
        Self::new(252, "Cannot VRFY user, but will accept message and attempt delivery")
    }

    pub fn help() -> Self {
        Self::new(214, "See RFC 5321")
    }

    pub fn quit() -> Self {
        Self::new(221, "Bye")
    }

    /// 421 sent to open connections when the server goes away
    pub fn shutting_down() -> Self {
        Self::new(421, "Service not available, closing transmission channel")
    }

    /// Format the reply for the wire
    pub fn format(&self) -> String {
        let mut result = match &self.multiline {
            Some(lines) if !lines.is_empty() => {
                let mut result = format!("{}-{}\r\n", self.code, self.message);
                for (i, line) in lines.iter().enumerate() {
                    let separator = if i == lines.len() - 1 { ' ' } else { '-' };
                    result.push_str(&format!("{}{separator}{line}\r\n", self.code));
                }
                result
            }
            _ => format!("{} {}\r\n", self.code, self.message),
        };

        if result.lines().any(|line| line.len() + 2 > SmtpLimits::REPLY_LINE_MAX_LENGTH) {
            result = format!("{} Response too long (truncated)\r\n", self.code);
        }
        result
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_error(&self) -> bool {
        self.code >= 400
    }
}
