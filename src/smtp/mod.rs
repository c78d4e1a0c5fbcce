//! SMTP protocol adapter and server

pub mod auth;
pub mod commands;
pub mod data;
pub mod error;
pub mod response;
pub mod server;
pub mod session;

pub use commands::{CommandOutcome, ConnectionState, SmtpCommandHandler};
pub use error::{SmtpError, SmtpLimits};
pub use response::SmtpResponse;
pub use server::SmtpServer;
pub use session::{SessionHandler, SessionLimits, SmtpSession, SmtpState};
