//! RFC 822 email to ingest event conversion.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use mail_parser::{MessageParser, MimeHeaders};

use super::model::{Attachment, Channel, NewIngestEvent, RawPayload};
use crate::error::IngestError;

/// Parse a raw email into a `NewIngestEvent`.
///
/// The body is the first text part (HTML stripped when there is no text
/// part) with quoted replies removed. Attachments are carried inline.
pub fn parse_email(raw: &[u8], channel: Channel) -> Result<NewIngestEvent, IngestError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| IngestError::Malformed("not an RFC 822 message".into()))?;

    let from = parsed.from().and_then(|addr| addr.first());
    let sender_email = from.and_then(|a| a.address()).map(|s| s.to_lowercase());
    let sender_name = from.and_then(|a| a.name()).map(str::to_string);

    let body = if let Some(text) = parsed.body_text(0) {
        strip_quoted_text(&text)
    } else if let Some(html) = parsed.body_html(0) {
        strip_quoted_text(&strip_html(&html))
    } else {
        String::new()
    };

    let attachments = parsed
        .attachments()
        .filter_map(|part| {
            let contents = part.contents();
            if contents.is_empty() {
                return None;
            }
            let media_type = MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into());
            let filename = MimeHeaders::attachment_name(part)
                .unwrap_or("attachment")
                .to_string();
            Some(Attachment {
                filename,
                media_type,
                size_bytes: contents.len() as u64,
                data: Some(BASE64.encode(contents)),
                storage_ref: None,
            })
        })
        .collect();

    Ok(NewIngestEvent {
        project_id: None,
        channel,
        raw_payload: RawPayload {
            subject: parsed.subject().map(str::to_string),
            body,
            attachments,
        },
        sender_email,
        sender_name,
        external_message_id: parsed.message_id().map(str::to_string),
    })
}

/// Drop quoted reply text: `>` lines and everything after an
/// "On ... wrote:" attribution or an "Original Message" separator.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            continue;
        }
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }
        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }
    result.join("\n")
}

/// Remove tags, keeping line breaks at block boundaries.
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut tag = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag.trim_start_matches('/').to_ascii_lowercase();
                if name.starts_with("br") || name.starts_with('p') || name.starts_with("div") {
                    result.push('\n');
                }
            }
            _ if in_tag => tag.push(ch),
            _ => result.push(ch),
        }
    }
    result
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
