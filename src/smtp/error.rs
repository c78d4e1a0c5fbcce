//! Error types for the SMTP server

use crate::smtp::response::SmtpResponse;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid command")]
    InvalidCommand,

    #[error("Command not implemented: {0}")]
    NotImplemented(String),

    #[error("Invalid syntax: {0}")]
    InvalidSyntax(String),

    #[error("Bad sequence of commands: {0}")]
    ProtocolViolation(String),

    #[error("Line too long (max {max} characters)")]
    LineTooLong { max: usize },

    #[error("Too many recipients (max {max})")]
    RecipientLimitExceeded { max: usize },

    #[error("Message too large (max {max} bytes)")]
    MessageTooLarge { max: usize },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Authentication not supported")]
    AuthUnsupported,

    #[error("Unrecognized authentication mechanism: {0}")]
    AuthMechanism(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

/// Protocol limits that do not come from configuration
pub struct SmtpLimits;

impl SmtpLimits {
    /// Maximum length of a command line including CRLF
    pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a reply line including CRLF
    pub const REPLY_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a reverse-path or forward-path
    pub const PATH_MAX_LENGTH: usize = 256;
}

/// Maps SMTP errors to reply codes
impl SmtpError {
    pub fn to_response_code(&self) -> u16 {
        match self {
            SmtpError::Io(_) | SmtpError::Bind { .. } => 421,
            SmtpError::InvalidCommand => 500,
            SmtpError::NotImplemented(_) => 502,
            SmtpError::InvalidSyntax(_) => 501,
            SmtpError::ProtocolViolation(_) => 503,
            SmtpError::LineTooLong { .. } => 500,
            SmtpError::RecipientLimitExceeded { .. } => 452,
            SmtpError::MessageTooLarge { .. } => 552,
            SmtpError::MalformedMessage(_) => 554,
            SmtpError::AuthUnsupported => 502,
            SmtpError::AuthMechanism(_) => 504,
            SmtpError::AuthFailed => 535,
            SmtpError::ConnectionClosed => 421,
        }
    }

    pub fn to_response_message(&self) -> String {
        match self {
            SmtpError::Io(_) | SmtpError::Bind { .. } => "Service not available".to_owned(),
            SmtpError::InvalidCommand => "Syntax error, command unrecognized".to_owned(),
            SmtpError::NotImplemented(cmd) => format!("{cmd} command not implemented"),
            SmtpError::InvalidSyntax(msg) => format!("Syntax error: {msg}"),
            SmtpError::ProtocolViolation(msg) => format!("Bad sequence of commands: {msg}"),
            SmtpError::LineTooLong { max } => format!("Line too long (max {max} characters)"),
            SmtpError::RecipientLimitExceeded { max } => {
                format!("Maximum limit of {max} recipients reached")
            }
            SmtpError::MessageTooLarge { max } => {
                format!("Maximum message size exceeded (max {max} bytes)")
            }
            SmtpError::MalformedMessage(msg) => format!("Transaction failed: {msg}"),
            SmtpError::AuthUnsupported => "Authentication not supported".to_owned(),
            SmtpError::AuthMechanism(mechanism) => {
                format!("Unrecognized authentication type {mechanism}")
            }
            SmtpError::AuthFailed => "Authentication credentials invalid".to_owned(),
            SmtpError::ConnectionClosed => "Connection closed".to_owned(),
        }
    }

    /// Reply sent to the client for this error
    pub fn to_response(&self) -> SmtpResponse {
        SmtpResponse::new(self.to_response_code(), &self.to_response_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_errors() {
        let err = SmtpError::RecipientLimitExceeded { max: 50 };
        assert_eq!(err.to_response().format(), "452 Maximum limit of 50 recipients reached\r\n");

        let err = SmtpError::MessageTooLarge { max: 1024 };
        assert_eq!(err.to_response_code(), 552);
    }

    #[test]
    fn test_sequence_errors() {
        let err = SmtpError::ProtocolViolation("need RCPT command".to_owned());
        assert_eq!(err.to_response_code(), 503);
        assert_eq!(
            err.to_response_message(),
            "Bad sequence of commands: need RCPT command"
        );
    }

    #[test]
    fn test_auth_errors() {
        assert_eq!(SmtpError::AuthFailed.to_response_code(), 535);
        assert_eq!(SmtpError::AuthUnsupported.to_response_code(), 502);
        assert_eq!(
            SmtpError::AuthMechanism("CRAM-MD5".to_owned()).to_response_code(),
            504
        );
    }
}
