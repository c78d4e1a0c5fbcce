use clap::Parser;
use log::LevelFilter;
use postcatch::{Mailbox, Settings, SmtpServer, SpamAssassin, SpamScorer, snapshot};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Local SMTP server that captures every message it receives
#[derive(Debug, Parser)]
#[command(name = "postcatch", version)]
struct Args {
    /// Settings file (JSON)
    #[arg(short, long, value_name = "FILE", default_value = "postcatch.json")]
    config: PathBuf,

    /// Interface to bind, overrides the settings file
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, overrides the settings file
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    let mut settings = match Settings::load(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Error loading {}: {e}", args.config.display());
            process::exit(1);
        }
    };
    if let Some(host) = args.host {
        settings.smtp.host = host;
    }
    if let Some(port) = args.port {
        settings.smtp.port = port;
    }

    let mailbox = Arc::new(Mailbox::new());
    let snapshot_path = match snapshot::open(&settings.persistence, &mailbox) {
        Ok(path) => path,
        Err(e) => {
            log::error!("Error opening snapshot: {e}");
            None
        }
    };

    let scorer = settings.spam_assassin.enabled.then(|| {
        let scanner = SpamAssassin::new(&settings.spam_assassin.binary);
        if !scanner.is_available() {
            log::warn!(
                "spam checks enabled but {} does not run",
                scanner.binary().display()
            );
        }
        SpamScorer::new(Arc::clone(&mailbox), scanner)
    });

    let events = mailbox.subscribe();
    let mut server = SmtpServer::new(settings.smtp, Arc::clone(&mailbox));
    if let Err(e) = server.start() {
        log::error!("Failed to start server: {e}");
        process::exit(1);
    }

    let mut count = 0;
    while let Ok(message) = events.recv() {
        count += 1;
        log::info!(
            "Received email #{count} from: {} to: {:?} subject: {:?}",
            message.from,
            message.to,
            message.subject
        );

        if let Some(scorer) = &scorer {
            if let Ok(report) = scorer.check(&message.id) {
                log::info!(
                    "  spam: {} (score {} / {}, {} rules)",
                    report.is_spam,
                    report.score,
                    report.threshold,
                    report.rules.len()
                );
            }
        }

        if let Some(path) = &snapshot_path {
            if let Err(e) = snapshot::save(path, &mailbox.list()) {
                log::error!("Error saving {}: {e}", path.display());
            }
        }
    }
}
