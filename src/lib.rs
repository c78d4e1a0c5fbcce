//! # Postcatch
//!
//! Postcatch is an in-process SMTP server that captures every message it
//! receives instead of delivering it.
//!
//! Captured messages are decomposed into subject, addresses, plain text and
//! HTML, kept in a shared [`Mailbox`] and announced on a bounded event
//! channel. A spam report can be requested for any captured message.
//!
//! ## Quick Start
//!
//! ```rust
//! use postcatch::{Mailbox, SmtpConfig, SmtpServer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let mailbox = Arc::new(Mailbox::new());
//! let events = mailbox.subscribe();
//!
//! let config = SmtpConfig {
//!     host: "127.0.0.1".to_owned(),
//!     port: 0,
//!     ..SmtpConfig::default()
//! };
//! let mut server = SmtpServer::new(config, Arc::clone(&mailbox));
//! let addr = server.start().unwrap();
//!
//! // Application sends email to `addr`
//! // ...
//!
//! // New messages arrive on the channel and stay in the mailbox
//! if let Ok(message) = events.recv_timeout(Duration::from_millis(100)) {
//!     println!("Received email from: {}", message.from);
//! }
//! println!("{} messages captured on {addr}", mailbox.len());
//!
//! server.stop();
//! ```
//!
//! ## Supported SMTP commands
//!
//! - `HELO` / `EHLO` - Identify the client (optional before `MAIL`)
//! - `MAIL FROM` - Specify the sender's address (`SIZE=` is honoured)
//! - `RCPT TO` - Specify the destination (multiple destinations are supported)
//! - `DATA` - Send the message
//! - `RSET` - Reset the current transaction
//! - `AUTH PLAIN` / `AUTH LOGIN` - Pass/fail gate driven by configuration
//! - `NOOP`, `VRFY`, `HELP` - Informational
//! - `QUIT` - Close connection
//!
//! `STARTTLS` is answered with 502.
//!
//! ## Limits
//!
//! - Command lines: 512 characters max
//! - Paths: 256 characters max
//! - Recipients: 50 per message by default ([`SmtpConfig::max_recipients`])
//! - Message size: 10 MiB by default ([`SmtpConfig::max_message_bytes`])
//!
//! ## Events
//!
//! [`Mailbox::subscribe`] returns the receiving end of a bounded channel
//! (100 messages by default). When the subscriber falls behind, new events
//! are dropped; the messages themselves are still in the mailbox.
//!
//! ## Spam reports
//!
//! [`SpamScorer::check`] runs `spamassassin -t` for a message on demand and
//! caches the parsed [`SpamReport`] until the mailbox is cleared.

pub mod config;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod mime;
pub mod smtp;
pub mod snapshot;
pub mod spam;

pub use config::{AuthMode, PersistenceConfig, Settings, SmtpConfig, SpamConfig, TlsMode};
pub use error::{ConfigError, MimeError, SnapshotError, SpamError};
pub use mailbox::Mailbox;
pub use message::Message;
pub use smtp::{SmtpError, SmtpLimits, SmtpResponse, SmtpServer, SmtpSession, SmtpState};
pub use spam::{Scanner, SpamAssassin, SpamReport, SpamRule, SpamScorer};
