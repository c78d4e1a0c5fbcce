//! Implementation of SMTP commands

use crate::config::SmtpConfig;
use crate::smtp::auth::{AuthGate, Mechanism};
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::{SessionHandler, SmtpState};

/// Per-connection state that lives outside the mail transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// Domain from the last HELO/EHLO
    pub client_domain: Option<String>,
    /// Whether AUTH succeeded on this connection
    pub authenticated: bool,
}

/// What the connection loop has to do after a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Send the reply and read the next command
    Reply(SmtpResponse),
    /// Send 354 and hand the message stream to the session
    ReceiveData,
    /// Run the AUTH exchange
    Auth {
        mechanism: Mechanism,
        initial: Option<String>,
    },
    /// Send the reply and close the connection
    Quit(SmtpResponse),
}

/// Parses command lines and drives a [`SessionHandler`]
#[derive(Debug, Clone)]
pub struct SmtpCommandHandler {
    hostname: String,
    max_message_bytes: usize,
    auth: AuthGate,
}

impl SmtpCommandHandler {
    pub fn new(config: &SmtpConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            max_message_bytes: config.max_message_bytes,
            auth: AuthGate::from_config(config),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn auth_gate(&self) -> &AuthGate {
        &self.auth
    }

    /// Process a command line and decide what happens next
    pub fn process_command<S: SessionHandler + ?Sized>(
        &self,
        command_line: &str,
        connection: &mut ConnectionState,
        session: &mut S,
    ) -> Result<CommandOutcome, SmtpError> {
        if command_line.len() > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            });
        }

        let command_line = command_line.trim();
        let (verb, args) = match command_line.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (command_line, ""),
        };
        if verb.is_empty() {
            return Err(SmtpError::InvalidCommand);
        }

        let reply = match verb.to_ascii_uppercase().as_str() {
            "HELO" => self.handle_helo(args, connection, session)?,
            "EHLO" => self.handle_ehlo(args, connection, session)?,
            "MAIL" => self.handle_mail(args, session)?,
            "RCPT" => self.handle_rcpt(args, session)?,
            "DATA" => return self.handle_data(args, session),
            "RSET" => {
                session.on_reset();
                SmtpResponse::ok()
            }
            "NOOP" => SmtpResponse::ok(),
            "VRFY" => SmtpResponse::cannot_verify(),
            "HELP" => SmtpResponse::help(),
            "AUTH" => return self.handle_auth(args, connection, session),
            "QUIT" => {
                session.on_logout();
                return Ok(CommandOutcome::Quit(SmtpResponse::quit()));
            }
            "STARTTLS" | "EXPN" | "TURN" => {
                return Err(SmtpError::NotImplemented(verb.to_ascii_uppercase()));
            }
            _ => return Err(SmtpError::InvalidCommand),
        };

        Ok(CommandOutcome::Reply(reply))
    }

    /// Extensions listed in the EHLO reply
    pub fn capabilities(&self, connection: &ConnectionState) -> Vec<String> {
        let mut capabilities = vec![
            "PIPELINING".to_owned(),
            "8BITMIME".to_owned(),
            format!("SIZE {}", self.max_message_bytes),
        ];
        if self.auth.is_offered() && !connection.authenticated {
            capabilities.push("AUTH PLAIN LOGIN".to_owned());
        }
        capabilities
    }

    fn handle_helo<S: SessionHandler + ?Sized>(
        &self,
        args: &str,
        connection: &mut ConnectionState,
        session: &mut S,
    ) -> Result<SmtpResponse, SmtpError> {
        let domain = greeting_domain("HELO", args)?;
        session.on_reset();
        let response = SmtpResponse::helo(&self.hostname, &domain);
        connection.client_domain = Some(domain);
        Ok(response)
    }

    fn handle_ehlo<S: SessionHandler + ?Sized>(
        &self,
        args: &str,
        connection: &mut ConnectionState,
        session: &mut S,
    ) -> Result<SmtpResponse, SmtpError> {
        let domain = greeting_domain("EHLO", args)?;
        session.on_reset();
        let response =
            SmtpResponse::ehlo(&self.hostname, &domain, self.capabilities(connection));
        connection.client_domain = Some(domain);
        Ok(response)
    }

    fn handle_mail<S: SessionHandler + ?Sized>(
        &self,
        args: &str,
        session: &mut S,
    ) -> Result<SmtpResponse, SmtpError> {
        let (from, params) = parse_path(args, "FROM:")?;

        for param in params.split_whitespace() {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if key.eq_ignore_ascii_case("SIZE") {
                let size: usize = value.parse().map_err(|_| {
                    SmtpError::InvalidSyntax(format!("invalid SIZE parameter {value}"))
                })?;
                if size > self.max_message_bytes {
                    return Err(SmtpError::MessageTooLarge {
                        max: self.max_message_bytes,
                    });
                }
            }
        }

        session.on_sender(from)?;
        Ok(SmtpResponse::ok())
    }

    fn handle_rcpt<S: SessionHandler + ?Sized>(
        &self,
        args: &str,
        session: &mut S,
    ) -> Result<SmtpResponse, SmtpError> {
        let (to, _params) = parse_path(args, "TO:")?;
        if to.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "TO address cannot be empty".to_owned(),
            ));
        }

        session.on_recipient(to)?;
        Ok(SmtpResponse::ok())
    }

    fn handle_data<S: SessionHandler + ?Sized>(
        &self,
        args: &str,
        session: &mut S,
    ) -> Result<CommandOutcome, SmtpError> {
        if !args.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "DATA command takes no arguments".to_owned(),
            ));
        }

        match session.state() {
            SmtpState::HasRecipients => Ok(CommandOutcome::ReceiveData),
            SmtpState::HasSender => Err(SmtpError::ProtocolViolation(
                "need RCPT before DATA".to_owned(),
            )),
            _ => Err(SmtpError::ProtocolViolation(
                "need MAIL before DATA".to_owned(),
            )),
        }
    }

    fn handle_auth<S: SessionHandler + ?Sized>(
        &self,
        args: &str,
        connection: &ConnectionState,
        session: &S,
    ) -> Result<CommandOutcome, SmtpError> {
        if !self.auth.is_offered() {
            return Err(SmtpError::AuthUnsupported);
        }
        if connection.authenticated {
            return Err(SmtpError::ProtocolViolation(
                "already authenticated".to_owned(),
            ));
        }
        if session.state() != SmtpState::Idle {
            return Err(SmtpError::ProtocolViolation(
                "AUTH not allowed during a mail transaction".to_owned(),
            ));
        }

        let mut words = args.split_whitespace();
        let Some(mechanism) = words.next() else {
            return Err(SmtpError::InvalidSyntax(
                "AUTH requires a mechanism".to_owned(),
            ));
        };
        let mechanism = mechanism.parse::<Mechanism>()?;
        let initial = words.next().map(str::to_owned);

        Ok(CommandOutcome::Auth { mechanism, initial })
    }
}

fn greeting_domain(verb: &str, args: &str) -> Result<String, SmtpError> {
    match args.split_whitespace().next() {
        Some(domain) => Ok(domain.to_owned()),
        None => Err(SmtpError::InvalidSyntax(format!(
            "{verb} requires domain argument"
        ))),
    }
}

/// Split `FROM:<addr> params` (or `TO:`) into the address and the rest.
/// The address itself is not validated.
fn parse_path<'a>(args: &'a str, prefix: &str) -> Result<(&'a str, &'a str), SmtpError> {
    let usage = || SmtpError::InvalidSyntax(format!("expected {prefix}<address>"));

    let head = args.get(..prefix.len()).ok_or_else(usage)?;
    if !head.eq_ignore_ascii_case(prefix) {
        return Err(usage());
    }

    let rest = args[prefix.len()..].trim_start();
    let rest = rest.strip_prefix('<').ok_or_else(usage)?;
    let end = rest.find('>').ok_or_else(usage)?;
    let address = &rest[..end];

    if address.len() > SmtpLimits::PATH_MAX_LENGTH {
        return Err(SmtpError::InvalidSyntax(format!(
            "path too long (max {} characters)",
            SmtpLimits::PATH_MAX_LENGTH
        )));
    }

    Ok((address, rest[end + 1..].trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMode;
    use crate::mailbox::Mailbox;
    use crate::smtp::session::{SessionLimits, SmtpSession};
    use std::sync::Arc;

    fn create_handler() -> SmtpCommandHandler {
        let config = SmtpConfig {
            hostname: "test.local".to_owned(),
            ..SmtpConfig::default()
        };
        SmtpCommandHandler::new(&config)
    }

    fn create_session() -> SmtpSession {
        SmtpSession::new(Arc::new(Mailbox::new()), SessionLimits::default())
    }

    fn reply(outcome: CommandOutcome) -> SmtpResponse {
        match outcome {
            CommandOutcome::Reply(response) => response,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    #[test]
    fn test_helo_command() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let response = reply(
            handler
                .process_command("HELO client.local", &mut connection, &mut session)
                .unwrap(),
        );

        assert_eq!(response.code, 250);
        assert_eq!(response.message, "test.local Hello client.local");
        assert_eq!(connection.client_domain.as_deref(), Some("client.local"));
    }

    #[test]
    fn test_helo_missing_domain() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let result = handler.process_command("HELO", &mut connection, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));
    }

    #[test]
    fn test_ehlo_capabilities() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let response = reply(
            handler
                .process_command("EHLO client.local", &mut connection, &mut session)
                .unwrap(),
        );

        let capabilities = response.multiline.unwrap();
        assert!(capabilities.contains(&"PIPELINING".to_owned()));
        assert!(capabilities.contains(&"SIZE 10485760".to_owned()));
        assert!(capabilities.contains(&"AUTH PLAIN LOGIN".to_owned()));
    }

    #[test]
    fn test_ehlo_without_auth() {
        let handler = SmtpCommandHandler::new(&SmtpConfig {
            allow_insecure_auth: false,
            ..SmtpConfig::default()
        });
        let capabilities = handler.capabilities(&ConnectionState::default());
        assert!(!capabilities.iter().any(|c| c.starts_with("AUTH")));
    }

    #[test]
    fn test_mail_without_helo() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let response = reply(
            handler
                .process_command("MAIL FROM:<sender@example.com>", &mut connection, &mut session)
                .unwrap(),
        );

        assert_eq!(response.code, 250);
        assert_eq!(session.from.as_deref(), Some("sender@example.com"));
        assert_eq!(session.state(), SmtpState::HasSender);
    }

    #[test]
    fn test_mail_address_not_validated() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        handler
            .process_command("mail from: <not an address>", &mut connection, &mut session)
            .unwrap();
        assert_eq!(session.from.as_deref(), Some("not an address"));

        handler
            .process_command("MAIL FROM:<>", &mut connection, &mut session)
            .unwrap();
        assert_eq!(session.from.as_deref(), Some(""));
    }

    #[test]
    fn test_mail_invalid_syntax() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        for line in ["MAIL", "MAIL TO:<a@x>", "MAIL FROM:a@x", "MAIL FROM:<a@x"] {
            let result = handler.process_command(line, &mut connection, &mut session);
            assert!(
                matches!(result, Err(SmtpError::InvalidSyntax(_))),
                "{line} should be rejected"
            );
        }
        assert_eq!(session.state(), SmtpState::Idle);
    }

    #[test]
    fn test_mail_size_parameter() {
        let handler = SmtpCommandHandler::new(&SmtpConfig {
            max_message_bytes: 1000,
            ..SmtpConfig::default()
        });
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let result = handler.process_command(
            "MAIL FROM:<a@x> SIZE=1001 BODY=8BITMIME",
            &mut connection,
            &mut session,
        );
        assert!(matches!(result, Err(SmtpError::MessageTooLarge { max: 1000 })));
        assert_eq!(session.state(), SmtpState::Idle);

        handler
            .process_command("MAIL FROM:<a@x> SIZE=1000", &mut connection, &mut session)
            .unwrap();
        assert_eq!(session.state(), SmtpState::HasSender);
    }

    #[test]
    fn test_rcpt_command() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut connection, &mut session)
            .unwrap();
        handler
            .process_command("RCPT TO:<one@example.com>", &mut connection, &mut session)
            .unwrap();
        handler
            .process_command("rcpt to:<two@example.com>", &mut connection, &mut session)
            .unwrap();

        assert_eq!(session.to, vec!["one@example.com", "two@example.com"]);
        assert_eq!(session.state(), SmtpState::HasRecipients);
    }

    #[test]
    fn test_rcpt_without_mail() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let result =
            handler.process_command("RCPT TO:<one@example.com>", &mut connection, &mut session);
        assert_eq!(result.unwrap_err().to_response_code(), 503);
    }

    #[test]
    fn test_rcpt_empty_address() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        handler
            .process_command("MAIL FROM:<a@x>", &mut connection, &mut session)
            .unwrap();
        let result = handler.process_command("RCPT TO:<>", &mut connection, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));
    }

    #[test]
    fn test_data_sequence() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let err = handler
            .process_command("DATA", &mut connection, &mut session)
            .unwrap_err();
        assert_eq!(err.to_response_code(), 503);

        handler
            .process_command("MAIL FROM:<a@x>", &mut connection, &mut session)
            .unwrap();
        let err = handler
            .process_command("DATA", &mut connection, &mut session)
            .unwrap_err();
        assert_eq!(err.to_response_message(), "Bad sequence of commands: need RCPT before DATA");

        handler
            .process_command("RCPT TO:<b@y>", &mut connection, &mut session)
            .unwrap();
        let outcome = handler
            .process_command("DATA", &mut connection, &mut session)
            .unwrap();
        assert_eq!(outcome, CommandOutcome::ReceiveData);
    }

    #[test]
    fn test_rset_command() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        handler
            .process_command("MAIL FROM:<a@x>", &mut connection, &mut session)
            .unwrap();
        handler
            .process_command("RCPT TO:<b@y>", &mut connection, &mut session)
            .unwrap();
        let response = reply(
            handler
                .process_command("RSET", &mut connection, &mut session)
                .unwrap(),
        );

        assert_eq!(response.code, 250);
        assert_eq!(session.state(), SmtpState::Idle);
        assert!(session.from.is_none());
        assert!(session.to.is_empty());
    }

    #[test]
    fn test_simple_commands() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let mut code = |line: &str| {
            let outcome = handler.process_command(line, &mut connection, &mut session);
            match outcome {
                Ok(CommandOutcome::Reply(response)) => response.code,
                Ok(other) => panic!("unexpected outcome {other:?}"),
                Err(e) => e.to_response_code(),
            }
        };

        assert_eq!(code("NOOP"), 250);
        assert_eq!(code("VRFY someone"), 252);
        assert_eq!(code("HELP"), 214);
        assert_eq!(code("STARTTLS"), 502);
        assert_eq!(code("BOGUS"), 500);
        assert_eq!(code(""), 500);
    }

    #[test]
    fn test_quit_command() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let outcome = handler
            .process_command("QUIT", &mut connection, &mut session)
            .unwrap();

        assert_eq!(outcome, CommandOutcome::Quit(SmtpResponse::quit()));
        assert!(session.is_logged_out());
    }

    #[test]
    fn test_line_too_long() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let line = format!("MAIL FROM:<{}@x>", "a".repeat(SmtpLimits::COMMAND_LINE_MAX_LENGTH));
        let result = handler.process_command(&line, &mut connection, &mut session);
        assert!(matches!(result, Err(SmtpError::LineTooLong { .. })));
    }

    #[test]
    fn test_auth_command() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let outcome = handler
            .process_command("AUTH PLAIN AGFsaWNlAHNlY3JldA==", &mut connection, &mut session)
            .unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::Auth {
                mechanism: Mechanism::Plain,
                initial: Some("AGFsaWNlAHNlY3JldA==".to_owned()),
            }
        );

        let result = handler.process_command("AUTH CRAM-MD5", &mut connection, &mut session);
        assert_eq!(result.unwrap_err().to_response_code(), 504);

        connection.authenticated = true;
        let result = handler.process_command("AUTH LOGIN", &mut connection, &mut session);
        assert_eq!(result.unwrap_err().to_response_code(), 503);
    }

    #[test]
    fn test_auth_during_transaction() {
        let handler = create_handler();
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        handler
            .process_command("MAIL FROM:<a@x>", &mut connection, &mut session)
            .unwrap();
        let result = handler.process_command("AUTH LOGIN", &mut connection, &mut session);
        assert!(matches!(result, Err(SmtpError::ProtocolViolation(_))));
    }

    #[test]
    fn test_auth_unsupported() {
        let handler = SmtpCommandHandler::new(&SmtpConfig {
            auth_mode: AuthMode::None,
            allow_insecure_auth: false,
            ..SmtpConfig::default()
        });
        let mut connection = ConnectionState::default();
        let mut session = create_session();

        let result = handler.process_command("AUTH PLAIN", &mut connection, &mut session);
        assert_eq!(result.unwrap_err().to_response_code(), 502);
    }
}
