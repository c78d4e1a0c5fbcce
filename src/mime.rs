//! MIME decomposition of DATA bytes into message fields
//!
//! Headers, RFC 2047 words and address lists are handled by `mailparse`.
//! Multipart bodies are split here so that a broken boundary can be reported
//! as a partial result instead of losing the parts that came before it.

use crate::error::MimeError;
use crate::message::Message;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mailparse::{MailAddr, MailHeader, MailHeaderMap, ParsedContentType};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Nested multipart containers deeper than this are not descended into
const MAX_NESTING: usize = 8;

/// Fields extracted from a raw message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decomposition {
    /// `From` header, verbatim
    pub from: Option<String>,
    /// `To` addresses, `None` when the header is absent
    pub to: Option<Vec<String>>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// `Reply-To` header, verbatim
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
    pub html: String,
    pub headers: BTreeMap<String, Vec<String>>,
    /// Set when the body could only be partly decomposed
    pub fault: Option<MimeError>,
}

/// Decompose raw DATA bytes.
///
/// Fails only when the header block is unusable. Problems inside the body are
/// recorded in [`Decomposition::fault`] and everything read up to that point
/// is kept.
pub fn decompose(raw: &[u8]) -> Result<Decomposition, MimeError> {
    check_header_block(raw)?;

    let (headers, body_offset) =
        mailparse::parse_headers(raw).map_err(|e| MimeError::MalformedMessage(e.to_string()))?;

    let mut parts = Decomposition::default();
    for header in &headers {
        let name = header.get_key();
        match name.to_ascii_lowercase().as_str() {
            "subject" => parts.subject = header.get_value().trim().to_owned(),
            "from" => parts.from = Some(raw_value(header)),
            "reply-to" => parts.reply_to = Some(raw_value(header)),
            "to" => parts.to.get_or_insert_with(Vec::new).extend(addresses(header)),
            "cc" => parts.cc.extend(addresses(header)),
            "bcc" => parts.bcc.extend(addresses(header)),
            _ => parts.headers.entry(name).or_default().push(raw_value(header)),
        }
    }

    let body = raw.get(body_offset..).unwrap_or_default();
    let Some(ctype) = content_type(&headers) else {
        parts.body = strip_line_ending(&String::from_utf8_lossy(body)).to_owned();
        return Ok(parts);
    };

    let walked = if ctype.mimetype.starts_with("multipart/") {
        walk_multipart(body, &ctype, 0, &mut parts)
    } else {
        leaf_text(raw).map(|text| {
            let text = strip_line_ending(&text).to_owned();
            if ctype.mimetype.starts_with("text/html") {
                parts.html = text;
            } else {
                parts.body = text;
            }
        })
    };

    if let Err(fault) = walked {
        log::warn!("{fault}");
        parts.fault = Some(fault);
    }

    Ok(parts)
}

/// Render a message back into RFC 5322 bytes.
///
/// Only the fields a reader sees are reproduced, so that decomposing the
/// result yields the same subject, sender, recipients and payloads.
pub fn compose(message: &Message) -> Vec<u8> {
    let mut out = String::new();

    if !message.from.is_empty() {
        push_header(&mut out, "From", &message.from);
    }
    if !message.to.is_empty() {
        push_header(&mut out, "To", &message.to.join(", "));
    }
    if !message.cc.is_empty() {
        push_header(&mut out, "Cc", &message.cc.join(", "));
    }
    if let Some(reply_to) = &message.reply_to {
        push_header(&mut out, "Reply-To", reply_to);
    }
    push_header(&mut out, "Subject", &encode_subject(&message.subject));

    for (name, values) in &message.headers {
        if is_content_header(name) {
            continue;
        }
        for value in values {
            push_header(&mut out, name, value);
        }
    }
    push_header(&mut out, "MIME-Version", "1.0");

    match (message.body.is_empty(), message.html.is_empty()) {
        (false, false) => {
            let boundary = format!("=_{}", Uuid::new_v4().simple());
            push_header(
                &mut out,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{boundary}\""),
            );
            out.push_str("\r\n");
            for (mimetype, payload) in [("text/plain", &message.body), ("text/html", &message.html)] {
                out.push_str(&format!("--{boundary}\r\n"));
                push_header(&mut out, "Content-Type", &format!("{mimetype}; charset=utf-8"));
                push_header(&mut out, "Content-Transfer-Encoding", "8bit");
                out.push_str("\r\n");
                out.push_str(payload);
                out.push_str("\r\n");
            }
            out.push_str(&format!("--{boundary}--\r\n"));
        }
        (true, false) => push_single(&mut out, "text/html", &message.html),
        _ => push_single(&mut out, "text/plain", &message.body),
    }

    out.into_bytes()
}

/// Encode a subject as an RFC 2047 word when it is not plain ASCII
pub(crate) fn encode_subject(subject: &str) -> String {
    if subject.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        subject.to_owned()
    } else {
        format!("=?utf-8?B?{}?=", STANDARD.encode(subject))
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

fn push_single(out: &mut String, mimetype: &str, payload: &str) {
    push_header(out, "Content-Type", &format!("{mimetype}; charset=utf-8"));
    push_header(out, "Content-Transfer-Encoding", "8bit");
    out.push_str("\r\n");
    out.push_str(payload);
    out.push_str("\r\n");
}

fn is_content_header(name: &str) -> bool {
    ["content-type", "content-transfer-encoding", "mime-version"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Reject input whose header block is not a sequence of `name: value` lines
fn check_header_block(raw: &[u8]) -> Result<(), MimeError> {
    if raw.is_empty() {
        return Err(MimeError::MalformedMessage("empty message".to_owned()));
    }

    for (index, line) in raw.split(|&b| b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }

        if line[0] == b' ' || line[0] == b'\t' {
            if index == 0 {
                return Err(MimeError::MalformedMessage(
                    "continuation line before the first header".to_owned(),
                ));
            }
            continue;
        }

        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(MimeError::MalformedMessage(format!(
                "header line {} has no colon",
                index + 1
            )));
        };
        let name = line[..colon].trim_ascii_end();
        if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
            return Err(MimeError::MalformedMessage(format!(
                "invalid header name on line {}",
                index + 1
            )));
        }
    }

    Ok(())
}

fn raw_value(header: &MailHeader) -> String {
    String::from_utf8_lossy(header.get_value_raw())
        .trim()
        .to_owned()
}

/// Parse an address list header into canonical address strings.
/// Unparsable lists fall back to a plain comma split.
fn addresses(header: &MailHeader) -> Vec<String> {
    match mailparse::addrparse_header(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![info.to_string()],
                MailAddr::Group(group) => group.addrs.iter().map(ToString::to_string).collect(),
            })
            .collect(),
        Err(e) => {
            log::debug!("unparsable {} header: {e}", header.get_key());
            raw_value(header)
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(str::to_owned)
                .collect()
        }
    }
}

/// `Content-Type` of an entity, `None` when absent or without a `type/subtype`
fn content_type(headers: &[MailHeader]) -> Option<ParsedContentType> {
    let value = headers.get_first_value("Content-Type")?;
    let ctype = mailparse::parse_content_type(&value);
    ctype.mimetype.contains('/').then_some(ctype)
}

/// Decoded text payload of a single-part entity (headers plus body)
fn leaf_text(entity: &[u8]) -> Result<String, MimeError> {
    mailparse::parse_mail(entity)
        .and_then(|mail| mail.get_body())
        .map_err(|e| MimeError::PartialDecomposition(format!("undecodable part: {e}")))
}

fn walk_multipart(
    body: &[u8],
    ctype: &ParsedContentType,
    depth: usize,
    parts: &mut Decomposition,
) -> Result<(), MimeError> {
    let boundary = ctype
        .params
        .get("boundary")
        .filter(|b| !b.is_empty())
        .ok_or_else(|| {
            MimeError::PartialDecomposition(format!("{} without a boundary", ctype.mimetype))
        })?;

    let (entities, split_fault) = split_multipart(body, boundary);
    for entity in entities {
        walk_part(entity, depth, parts)?;
    }

    match split_fault {
        Some(fault) => Err(fault),
        None => Ok(()),
    }
}

fn walk_part(entity: &[u8], depth: usize, parts: &mut Decomposition) -> Result<(), MimeError> {
    let (headers, body_offset) = mailparse::parse_headers(entity)
        .map_err(|e| MimeError::PartialDecomposition(format!("bad part headers: {e}")))?;
    let Some(ctype) = content_type(&headers) else {
        return Ok(());
    };

    if ctype.mimetype.starts_with("text/plain") {
        parts.body = leaf_text(entity)?;
    } else if ctype.mimetype.starts_with("text/html") {
        parts.html = leaf_text(entity)?;
    } else if ctype.mimetype.starts_with("multipart/") && depth < MAX_NESTING {
        let body = entity.get(body_offset..).unwrap_or_default();
        walk_multipart(body, &ctype, depth + 1, parts)?;
    }

    Ok(())
}

/// Split a multipart body into its entities.
///
/// Returns every entity that was closed by a following delimiter, plus a
/// fault when the opening or the closing delimiter is missing.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> (Vec<&'a [u8]>, Option<MimeError>) {
    let delimiter = format!("--{boundary}");
    let mut entities = Vec::new();
    let mut entity_start = None;
    let mut offset = 0;

    while offset < body.len() {
        let line_end = body[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(body.len(), |i| offset + i + 1);
        let line = trim_line(&body[offset..line_end]);

        if let Some(rest) = line.strip_prefix(delimiter.as_bytes()) {
            let closing = rest == b"--";
            if rest.is_empty() || closing {
                if let Some(start) = entity_start {
                    entities.push(&body[start..entity_end(body, start, offset)]);
                }
                if closing {
                    return (entities, None);
                }
                entity_start = Some(line_end);
            }
        }

        offset = line_end;
    }

    let fault = if entity_start.is_some() {
        format!("missing closing boundary \"{boundary}\"")
    } else {
        format!("boundary \"{boundary}\" never opens a part")
    };
    (entities, Some(MimeError::PartialDecomposition(fault)))
}

/// The line break before a delimiter belongs to the delimiter
fn entity_end(body: &[u8], start: usize, delimiter_at: usize) -> usize {
    let mut end = delimiter_at;
    if end > start && body[end - 1] == b'\n' {
        end -= 1;
        if end > start && body[end - 1] == b'\r' {
            end -= 1;
        }
    }
    end
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n' | b' ' | b'\t') {
        end -= 1;
    }
    &line[..end]
}

fn strip_line_ending(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}
