//! SMTP server implementation

use crate::config::SmtpConfig;
use crate::mailbox::Mailbox;
use crate::smtp::auth;
use crate::smtp::commands::{CommandOutcome, ConnectionState, SmtpCommandHandler};
use crate::smtp::data::DataReader;
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::{SessionHandler, SessionLimits, SmtpSession};

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the accept loop sleeps when no connection is pending
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// SMTP server that stores received messages in a shared [`Mailbox`].
///
/// `start` returns as soon as the listener is bound; connections are served
/// on background threads, one per client. The mailbox is shared, not owned,
/// so messages survive `stop` and `restart`.
#[derive(Debug)]
pub struct SmtpServer {
    config: SmtpConfig,
    mailbox: Arc<Mailbox>,
    running: Option<Running>,
}

#[derive(Debug)]
struct Running {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Connections>,
    acceptor: JoinHandle<()>,
}

/// Open client sockets, so `stop` can close them
#[derive(Debug, Default)]
struct Connections {
    next_id: AtomicU64,
    streams: Mutex<HashMap<u64, TcpStream>>,
}

impl Connections {
    fn register(&self, stream: &TcpStream) -> io::Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let clone = stream.try_clone()?;
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, clone);
        Ok(id)
    }

    fn unregister(&self, id: u64) {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn close_all(&self) {
        let streams: Vec<TcpStream> = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, stream)| stream)
            .collect();

        for mut stream in streams {
            // The client may already be gone
            let _ = stream.write_all(SmtpResponse::shutting_down().format().as_bytes());
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn len(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Everything a connection thread needs, built once per `start`
struct ConnectionContext {
    handler: SmtpCommandHandler,
    limits: SessionLimits,
    mailbox: Arc<Mailbox>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl SmtpServer {
    /// Create a server; nothing is bound until [`SmtpServer::start`]
    pub fn new(config: SmtpConfig, mailbox: Arc<Mailbox>) -> Self {
        Self {
            config,
            mailbox,
            running: None,
        }
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.addr)
    }

    /// Number of clients currently connected
    pub fn connection_count(&self) -> usize {
        self.running
            .as_ref()
            .map_or(0, |running| running.connections.len())
    }

    /// Bind the configured address and start accepting connections.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested. Calling `start` on a running server returns the
    /// current address.
    pub fn start(&mut self) -> Result<SocketAddr, SmtpError> {
        if let Some(running) = &self.running {
            return Ok(running.addr);
        }

        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr).map_err(|source| SmtpError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Connections::default());
        let context = Arc::new(ConnectionContext {
            handler: SmtpCommandHandler::new(&self.config),
            limits: SessionLimits::from_config(&self.config),
            mailbox: Arc::clone(&self.mailbox),
            read_timeout: self.config.read_timeout(),
            write_timeout: self.config.write_timeout(),
        });

        let acceptor = {
            let shutdown = Arc::clone(&shutdown);
            let connections = Arc::clone(&connections);
            thread::Builder::new()
                .name("smtp-accept".to_owned())
                .spawn(move || accept_loop(listener, shutdown, connections, context))?
        };

        log::info!("SMTP server listening on {local_addr}");
        self.running = Some(Running {
            addr: local_addr,
            shutdown,
            connections,
            acceptor,
        });
        Ok(local_addr)
    }

    /// Close the listener and every open connection. Does nothing when the
    /// server is not running.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.shutdown.store(true, Ordering::SeqCst);
        if running.acceptor.join().is_err() {
            log::error!("SMTP accept thread panicked");
        }
        running.connections.close_all();
        log::info!("SMTP server on {} stopped", running.addr);
    }

    /// Stop, switch to `config` and start again
    pub fn restart(&mut self, config: SmtpConfig) -> Result<SocketAddr, SmtpError> {
        self.stop();
        self.config = config;
        self.start()
    }
}

impl Drop for SmtpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Connections>,
    context: Arc<ConnectionContext>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                // Registered before the thread starts so `stop` sees every
                // accepted socket
                let id = match connections.register(&stream) {
                    Ok(id) => id,
                    Err(e) => {
                        log::error!("Error registering connection from {peer}: {e}");
                        continue;
                    }
                };

                let thread_connections = Arc::clone(&connections);
                let context = Arc::clone(&context);
                let spawned = thread::Builder::new()
                    .name(format!("smtp-{peer}"))
                    .spawn(move || serve(stream, peer, id, &thread_connections, &context));
                if let Err(e) = spawned {
                    log::error!("Error spawning connection thread for {peer}: {e}");
                    connections.unregister(id);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                log::error!("Error accepting connection: {e}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    // The listener is dropped, and so closed, here
}

fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    connections: &Connections,
    context: &ConnectionContext,
) {
    log::debug!("connection from {peer}");
    match handle_client(stream, context) {
        Ok(()) => log::debug!("connection from {peer} closed"),
        Err(SmtpError::Io(e)) if is_timeout(&e) => {
            log::debug!("connection from {peer} timed out");
        }
        Err(e) => log::debug!("connection from {peer} ended: {e}"),
    }
    connections.unregister(id);
}

/// Handle a client connection
fn handle_client(stream: TcpStream, context: &ConnectionContext) -> Result<(), SmtpError> {
    // Accepted sockets may inherit the listener's non-blocking mode
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(context.read_timeout)?;
    stream.set_write_timeout(context.write_timeout)?;

    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut connection = ConnectionState::default();
    let mut session = SmtpSession::new(Arc::clone(&context.mailbox), context.limits);
    let handler = &context.handler;

    send_response(&mut writer, &SmtpResponse::greeting(handler.hostname()))?;

    let mut line = Vec::new();
    let result = loop {
        let command = match read_command_line(&mut reader, &mut line) {
            Ok(Some(command)) => command,
            Ok(None) => break Ok(()),
            Err(SmtpError::LineTooLong { max }) => {
                send_response(&mut writer, &SmtpError::LineTooLong { max }.to_response())?;
                continue;
            }
            Err(e) => break Err(e),
        };
        if command.trim().is_empty() {
            continue;
        }

        let outcome = match handler.process_command(&command, &mut connection, &mut session) {
            Ok(outcome) => outcome,
            Err(e) => {
                send_response(&mut writer, &e.to_response())?;
                continue;
            }
        };

        match outcome {
            CommandOutcome::Reply(response) => send_response(&mut writer, &response)?,
            CommandOutcome::ReceiveData => {
                send_response(&mut writer, &SmtpResponse::data_start())?;
                let mut data = DataReader::new(&mut reader);
                let response = match session.on_data(&mut data) {
                    Ok(message) => SmtpResponse::queued(&message.id),
                    Err(SmtpError::Io(e)) => break Err(SmtpError::Io(e)),
                    Err(e) => e.to_response(),
                };
                send_response(&mut writer, &response)?;
            }
            CommandOutcome::Auth { mechanism, initial } => {
                let response = match authenticate(
                    handler,
                    mechanism,
                    initial.as_deref(),
                    &mut reader,
                    &mut writer,
                ) {
                    Ok(()) => {
                        connection.authenticated = true;
                        SmtpResponse::auth_success()
                    }
                    Err(SmtpError::Io(e)) => break Err(SmtpError::Io(e)),
                    Err(SmtpError::ConnectionClosed) => break Ok(()),
                    Err(e) => e.to_response(),
                };
                send_response(&mut writer, &response)?;
            }
            CommandOutcome::Quit(response) => {
                send_response(&mut writer, &response)?;
                return Ok(());
            }
        }
    };

    session.on_logout();
    result
}

fn authenticate<R: BufRead>(
    handler: &SmtpCommandHandler,
    mechanism: auth::Mechanism,
    initial: Option<&str>,
    reader: &mut R,
    writer: &mut TcpStream,
) -> Result<(), SmtpError> {
    let mut line = Vec::new();
    let credentials = auth::exchange(mechanism, initial, |prompt| {
        send_response(&mut *writer, &SmtpResponse::auth_challenge(prompt))?;
        read_command_line(&mut *reader, &mut line)?.ok_or(SmtpError::ConnectionClosed)
    })?;

    handler.auth_gate().verify(&credentials)?;
    log::debug!("client authenticated as {}", credentials.username);
    Ok(())
}

/// Read one CRLF-terminated line, bounded by the command line limit.
/// Returns `None` at end of stream. An over-long line is consumed up to its
/// end and reported as `LineTooLong`.
fn read_command_line<R: BufRead>(
    reader: &mut R,
    line: &mut Vec<u8>,
) -> Result<Option<String>, SmtpError> {
    let limit = SmtpLimits::COMMAND_LINE_MAX_LENGTH as u64;

    line.clear();
    let read = reader.by_ref().take(limit).read_until(b'\n', line)?;
    if read == 0 {
        return Ok(None);
    }

    if !line.ends_with(b"\n") && read as u64 == limit {
        loop {
            line.clear();
            let read = reader.by_ref().take(limit).read_until(b'\n', line)?;
            if read == 0 || line.ends_with(b"\n") {
                break;
            }
        }
        return Err(SmtpError::LineTooLong {
            max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
        });
    }

    let text = String::from_utf8_lossy(line);
    Ok(Some(text.trim_end_matches(['\r', '\n']).to_owned()))
}

/// Send a response to the client
fn send_response<W: Write>(stream: &mut W, response: &SmtpResponse) -> Result<(), SmtpError> {
    stream.write_all(response.format().as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SmtpConfig {
        SmtpConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            hostname: "test.local".to_owned(),
            ..SmtpConfig::default()
        }
    }

    #[test]
    fn test_server_creation() {
        let server = SmtpServer::new(test_config(), Arc::new(Mailbox::new()));
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        assert_eq!(server.config().hostname, "test.local");
    }

    #[test]
    fn test_start_and_stop() {
        let mut server = SmtpServer::new(test_config(), Arc::new(Mailbox::new()));

        let addr = server.start().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert_eq!(server.start().unwrap(), addr);

        server.stop();
        assert!(!server.is_running());
        server.stop();
    }

    fn reply_line(reader: &mut impl BufRead) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }

    fn wait_for_connections(server: &SmtpServer, expected: usize) {
        for _ in 0..200 {
            if server.connection_count() == expected {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.connection_count(), expected);
    }

    #[test]
    fn test_connection_count() {
        let mailbox = Arc::new(Mailbox::new());
        let mut server = SmtpServer::new(test_config(), Arc::clone(&mailbox));
        assert!(Arc::ptr_eq(server.mailbox(), &mailbox));
        assert_eq!(server.connection_count(), 0);

        let addr = server.start().unwrap();
        let first = TcpStream::connect(addr).unwrap();
        let mut first_reader = BufReader::new(first.try_clone().unwrap());
        assert!(reply_line(&mut first_reader).starts_with("220 "));
        let second = TcpStream::connect(addr).unwrap();
        let mut second_reader = BufReader::new(second.try_clone().unwrap());
        assert!(reply_line(&mut second_reader).starts_with("220 "));
        assert_eq!(server.connection_count(), 2);

        (&first).write_all(b"QUIT\r\n").unwrap();
        assert!(reply_line(&mut first_reader).starts_with("221 "));
        wait_for_connections(&server, 1);

        server.stop();
        assert_eq!(server.connection_count(), 0);
        assert!(reply_line(&mut second_reader).starts_with("421 "));
    }

    #[test]
    fn test_drop_stops_server() {
        let mut server = SmtpServer::new(test_config(), Arc::new(Mailbox::new()));
        let addr = server.start().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let mut reader = BufReader::new(client);
        assert!(reply_line(&mut reader).starts_with("220 "));

        drop(server);

        assert!(reply_line(&mut reader).starts_with("421 "));
        assert_eq!(reply_line(&mut reader), "");
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = SmtpConfig {
            port: taken.local_addr().unwrap().port(),
            ..test_config()
        };
        let mut server = SmtpServer::new(config, Arc::new(Mailbox::new()));

        assert!(matches!(server.start(), Err(SmtpError::Bind { .. })));
        assert!(!server.is_running());
    }

    #[test]
    fn test_read_command_line() {
        let mut input: &[u8] = b"HELO a\r\nNOOP\n";
        let mut line = Vec::new();

        assert_eq!(
            read_command_line(&mut input, &mut line).unwrap().as_deref(),
            Some("HELO a")
        );
        assert_eq!(
            read_command_line(&mut input, &mut line).unwrap().as_deref(),
            Some("NOOP")
        );
        assert!(read_command_line(&mut input, &mut line).unwrap().is_none());
    }

    #[test]
    fn test_read_command_line_too_long() {
        let long = format!(
            "NOOP {}\r\nQUIT\r\n",
            "x".repeat(2 * SmtpLimits::COMMAND_LINE_MAX_LENGTH)
        );
        let mut input = long.as_bytes();
        let mut line = Vec::new();

        assert!(matches!(
            read_command_line(&mut input, &mut line),
            Err(SmtpError::LineTooLong { .. })
        ));
        assert_eq!(
            read_command_line(&mut input, &mut line).unwrap().as_deref(),
            Some("QUIT")
        );
    }
}
