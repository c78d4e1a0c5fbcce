//! On-demand spam scoring through an external scanner
//!
//! Scoring is pull-based: nothing is scanned when a message arrives. A caller
//! asks for a report by message id, the report is computed once by running
//! the scanner and kept in the mailbox until the mailbox is cleared.

use crate::error::SpamError;
use crate::mailbox::Mailbox;
use crate::message::Message;
use crate::mime;

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

/// Result of scanning one message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpamReport {
    pub is_spam: bool,
    pub score: f64,
    pub threshold: f64,
    pub rules: Vec<SpamRule>,
    /// Scanner output as received
    pub raw_report: String,
}

/// A rule that matched, as listed in the content analysis details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamRule {
    pub name: String,
    pub description: String,
    pub score: f64,
}

/// Something that turns message bytes into a textual spam report
pub trait Scanner: Send + Sync {
    fn scan(&self, message: &[u8]) -> Result<String, SpamError>;
}

/// Runs the `spamassassin` binary in test mode (`-t`)
#[derive(Debug, Clone)]
pub struct SpamAssassin {
    binary: PathBuf,
}

impl SpamAssassin {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Probe the binary with `--version`
    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

impl Scanner for SpamAssassin {
    fn scan(&self, message: &[u8]) -> Result<String, SpamError> {
        let mut child = Command::new(&self.binary)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SpamError::ScannerUnavailable {
                binary: self.binary.clone(),
                source,
            })?;

        // Feed stdin from another thread so a chatty scanner cannot fill its
        // stdout pipe while we are still writing
        let feeder = child.stdin.take().map(|mut stdin| {
            let message = message.to_vec();
            thread::spawn(move || stdin.write_all(&message))
        });

        let output = child
            .wait_with_output()
            .map_err(|e| SpamError::ScannerError(e.to_string()))?;

        if let Some(feeder) = feeder {
            match feeder.join() {
                Ok(Ok(())) => {}
                // The scanner may exit before reading everything; its status decides
                Ok(Err(e)) => log::debug!("scanner closed stdin early: {e}"),
                Err(_) => log::warn!("scanner stdin writer panicked"),
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                format!("{} exited with {}", self.binary.display(), output.status)
            } else {
                stderr.trim().to_owned()
            };
            return Err(SpamError::ScannerError(detail));
        }

        let report = String::from_utf8_lossy(&output.stdout).into_owned();
        log::debug!("scanner output:\n{report}");
        Ok(report)
    }
}

/// Where `spamassassin` is usually installed on this platform
pub fn default_binary_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/usr/local/bin/spamassassin")
    } else if cfg!(windows) {
        let candidates = [
            r"C:\Program Files\SpamAssassin\spamassassin.exe",
            r"C:\Program Files (x86)\SpamAssassin\spamassassin.exe",
        ];
        candidates
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from(candidates[0]))
    } else {
        PathBuf::from("/usr/bin/spamassassin")
    }
}

/// Computes and caches spam reports for messages in a mailbox
pub struct SpamScorer<S = SpamAssassin> {
    mailbox: Arc<Mailbox>,
    scanner: S,
}

impl<S: Scanner> SpamScorer<S> {
    pub fn new(mailbox: Arc<Mailbox>, scanner: S) -> Self {
        Self { mailbox, scanner }
    }

    pub fn scanner(&self) -> &S {
        &self.scanner
    }

    /// Report for a message, from the cache when it was already computed.
    ///
    /// Runs the scanner synchronously on the calling thread; there is no
    /// timeout.
    pub fn check(&self, id: &str) -> Result<Arc<SpamReport>, SpamError> {
        if let Some(report) = self.mailbox.cached_report(id) {
            return Ok(report);
        }

        let message = self
            .mailbox
            .get(id)
            .ok_or_else(|| SpamError::NotFound(id.to_owned()))?;

        let output = self.scanner.scan(&probe(&message)).inspect_err(|e| {
            log::warn!("spam check for {id} failed: {e}");
        })?;
        let report = Arc::new(parse_report(&output));
        log::info!(
            "spam check for {id}: score {} / {}",
            report.score,
            report.threshold
        );

        self.mailbox.cache_report(id, Arc::clone(&report));
        Ok(report)
    }
}

/// Minimal message handed to the scanner: sender, recipients, subject and
/// the HTML payload, or the plain one when there is no HTML
fn probe(message: &Message) -> Vec<u8> {
    let (mimetype, payload) = if message.html.is_empty() {
        ("text/plain", &message.body)
    } else {
        ("text/html", &message.html)
    };

    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nContent-Type: {mimetype}; charset=utf-8\r\n\r\n{payload}",
        message.from,
        message.to.join(", "),
        mime::encode_subject(&message.subject),
    )
    .into_bytes()
}

/// Parse the text printed by `spamassassin -t`.
///
/// The verdict comes from the `X-Spam-Status` header, the rules from the
/// table following "Content analysis details". Lines of that table that do
/// not start with a score are skipped. The table ends at the first blank
/// line after a rule or at a MIME boundary, since spam is usually returned
/// wrapped with the original message attached after the report.
pub fn parse_report(output: &str) -> SpamReport {
    let mut report = SpamReport {
        raw_report: output.to_owned(),
        ..SpamReport::default()
    };

    let mut lines = output.lines().peekable();
    let mut status_seen = false;
    let mut in_rules = false;

    while let Some(line) = lines.next() {
        if !status_seen {
            if let Some(value) = line.strip_prefix("X-Spam-Status:") {
                let mut status = value.to_owned();
                while let Some(next) = lines.next_if(|l| l.starts_with([' ', '\t'])) {
                    status.push(' ');
                    status.push_str(next.trim());
                }
                apply_status(&mut report, &status);
                status_seen = true;
                continue;
            }
        }

        let line = line.trim();
        if line.starts_with("Content analysis details") {
            in_rules = true;
            continue;
        }

        if in_rules {
            if (line.is_empty() && !report.rules.is_empty()) || is_mime_boundary(line) {
                break;
            }
            if let Some(rule) = parse_rule(line) {
                report.rules.push(rule);
            }
        }
    }

    report
}

/// `------------=_6543` but not the `---- ------` column rule
fn is_mime_boundary(line: &str) -> bool {
    line.starts_with("--") && !line.chars().all(|c| c == '-' || c.is_whitespace())
}

/// `Yes, score=7.2 required=5.0 tests=A,B autolearn=no`
fn apply_status(report: &mut SpamReport, status: &str) {
    let mut tokens = status
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty());

    if let Some(verdict) = tokens.next() {
        report.is_spam = verdict.eq_ignore_ascii_case("yes");
    }

    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "score" | "hits" => {
                if let Ok(score) = value.parse() {
                    report.score = score;
                }
            }
            "required" => {
                if let Ok(threshold) = value.parse() {
                    report.threshold = threshold;
                }
            }
            _ => {}
        }
    }
}

/// ` 1.5 HTML_MESSAGE           BODY: HTML included in message`
fn parse_rule(line: &str) -> Option<SpamRule> {
    let mut fields = line.splitn(3, char::is_whitespace);
    let score = fields.next()?.parse::<f64>().ok()?;
    let name = fields.next().filter(|name| !name.is_empty())?;
    let description = fields.next().unwrap_or_default().trim();

    Some(SpamRule {
        name: name.to_owned(),
        description: description.to_owned(),
        score,
    })
}
