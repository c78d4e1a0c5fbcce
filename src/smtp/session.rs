//! SMTP session state machine
//!
//! The state machine knows nothing about sockets. A protocol adapter parses
//! commands off the wire and drives it through [`SessionHandler`].

use crate::config::SmtpConfig;
use crate::error::MimeError;
use crate::mailbox::Mailbox;
use crate::message::Message;
use crate::mime;
use crate::smtp::error::SmtpError;

use std::io::{self, Read};
use std::sync::Arc;

/// Where a session stands in the mail transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// No transaction in progress
    Idle,
    /// MAIL FROM received
    HasSender,
    /// At least one RCPT TO received
    HasRecipients,
    /// Message content is being read
    ReceivingData,
}

/// Operations a protocol adapter invokes on a session
pub trait SessionHandler {
    /// Current transaction state
    fn state(&self) -> SmtpState;

    /// `MAIL FROM`. Replaces the sender of an ongoing transaction.
    fn on_sender(&mut self, from: &str) -> Result<(), SmtpError>;

    /// `RCPT TO`
    fn on_recipient(&mut self, to: &str) -> Result<(), SmtpError>;

    /// Message content after `DATA`, already unstuffed and cut at the terminator
    fn on_data(&mut self, data: &mut dyn Read) -> Result<Arc<Message>, SmtpError>;

    /// `RSET`
    fn on_reset(&mut self);

    /// `QUIT` or disconnect
    fn on_logout(&mut self);
}

/// Limits a session enforces, taken from the server configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_recipients: usize,
    pub max_message_bytes: usize,
}

impl SessionLimits {
    pub fn from_config(config: &SmtpConfig) -> Self {
        Self {
            max_recipients: config.max_recipients,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from_config(&SmtpConfig::default())
    }
}

/// Session that stores every accepted message in a [`Mailbox`]
#[derive(Debug)]
pub struct SmtpSession {
    /// Current state of the session
    pub state: SmtpState,
    /// Sender address from MAIL FROM
    pub from: Option<String>,
    /// Recipients from RCPT TO
    pub to: Vec<String>,
    /// Message bytes collected during DATA
    pub buffer: Vec<u8>,
    limits: SessionLimits,
    mailbox: Arc<Mailbox>,
    logged_out: bool,
}

impl SmtpSession {
    pub fn new(mailbox: Arc<Mailbox>, limits: SessionLimits) -> Self {
        Self {
            state: SmtpState::Idle,
            from: None,
            to: Vec::new(),
            buffer: Vec::new(),
            limits,
            mailbox,
            logged_out: false,
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    pub fn recipient_count(&self) -> usize {
        self.to.len()
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out
    }

    fn clear_transaction(&mut self) {
        self.state = SmtpState::Idle;
        self.from = None;
        self.to.clear();
        self.buffer = Vec::new();
    }

    /// Read the message into the buffer, draining the rest of the stream
    /// when it is over the size limit
    fn receive(&mut self, data: &mut dyn Read) -> Result<(), SmtpError> {
        let max = self.limits.max_message_bytes;
        let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);

        (&mut *data).take(limit).read_to_end(&mut self.buffer)?;
        if self.buffer.len() > max {
            self.buffer = Vec::new();
            io::copy(data, &mut io::sink())?;
            return Err(SmtpError::MessageTooLarge { max });
        }

        Ok(())
    }
}

impl SessionHandler for SmtpSession {
    fn state(&self) -> SmtpState {
        self.state
    }

    fn on_sender(&mut self, from: &str) -> Result<(), SmtpError> {
        self.from = Some(from.to_owned());
        if self.state == SmtpState::Idle {
            self.state = SmtpState::HasSender;
        }
        Ok(())
    }

    fn on_recipient(&mut self, to: &str) -> Result<(), SmtpError> {
        match self.state {
            SmtpState::HasSender | SmtpState::HasRecipients => {}
            _ => {
                return Err(SmtpError::ProtocolViolation("need MAIL before RCPT".to_owned()));
            }
        }

        if self.to.len() >= self.limits.max_recipients {
            return Err(SmtpError::RecipientLimitExceeded {
                max: self.limits.max_recipients,
            });
        }

        self.to.push(to.to_owned());
        self.state = SmtpState::HasRecipients;
        Ok(())
    }

    fn on_data(&mut self, data: &mut dyn Read) -> Result<Arc<Message>, SmtpError> {
        if self.state != SmtpState::HasRecipients {
            return Err(SmtpError::ProtocolViolation("need RCPT before DATA".to_owned()));
        }

        self.state = SmtpState::ReceivingData;
        self.buffer.clear();

        if let Err(e) = self.receive(data) {
            self.clear_transaction();
            return Err(e);
        }

        let raw = std::mem::take(&mut self.buffer);
        let from = self.from.take().unwrap_or_default();
        let to = std::mem::take(&mut self.to);
        self.clear_transaction();

        let parts = match mime::decompose(&raw) {
            Ok(parts) => parts,
            Err(MimeError::MalformedMessage(reason) | MimeError::PartialDecomposition(reason)) => {
                log::info!("rejected message from <{from}>: {reason}");
                return Err(SmtpError::MalformedMessage(reason));
            }
        };

        let message = self.mailbox.append(Message::capture(from, to, raw, parts));
        log::info!(
            "captured message {} from <{}> to {:?} ({} bytes)",
            message.id,
            message.envelope_from,
            message.envelope_to,
            message.size()
        );
        Ok(message)
    }

    fn on_reset(&mut self) {
        self.clear_transaction();
    }

    fn on_logout(&mut self) {
        if self.state == SmtpState::ReceivingData {
            log::debug!("session ended during DATA, nothing stored");
        }
        self.clear_transaction();
        self.logged_out = true;
    }
}
