//! Parser adapter over `mail-parser`.
//!
//! Turns the raw bytes of a delivery into a [`Message`] plus the separable
//! [`Attachment`] payloads. Whether the raw header mapping is included is
//! fixed when the [`MimeParser`] is built.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mail_parser::{Address, HeaderName, MessageParser, MimeHeaders, PartType};
use thiserror::Error;

use crate::{AddressList, Attachment, EmailAddress, Message};

/// Errors produced while parsing a raw message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The delivery carried no content at all.
    #[error("Empty message")]
    Empty,
    /// The content could not be read as an RFC 5322 message.
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Controls whether the raw header mapping is kept on parsed messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeaderMode {
    #[default]
    Omit,
    Include,
}

impl From<bool> for HeaderMode {
    fn from(include: bool) -> Self {
        if include {
            HeaderMode::Include
        } else {
            HeaderMode::Omit
        }
    }
}

/// Result of parsing a delivery, the message with stripped attachment
/// metadata and the full attachment payloads in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub message: Message,
    pub attachments: Vec<Attachment>,
}

/// Parser adapter, cheap to clone and safe to share across sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MimeParser {
    headers: HeaderMode,
}

impl MimeParser {
    pub fn new(headers: HeaderMode) -> Self {
        Self { headers }
    }

    pub fn header_mode(&self) -> HeaderMode {
        self.headers
    }

    /// Parses `raw` into a structured message.
    ///
    /// `received_at` is used as the message date when the `Date` header is
    /// missing or unparsable. The identifier is left empty when there is no
    /// `Message-ID` header, the caller decides how to fill it.
    pub fn parse(
        &self,
        raw: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<ParsedMessage, ParseError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(ParseError::Empty);
        }

        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| ParseError::Malformed("unreadable MIME structure".to_string()))?;
        // at least one registered RFC 5322 or MIME header must be present
        let has_headers = parsed
            .headers()
            .iter()
            .any(|header| !matches!(header.name, HeaderName::Other(_)));
        if !has_headers {
            return Err(ParseError::Malformed("missing header section".to_string()));
        }

        let attachments = parsed
            .attachments()
            .enumerate()
            .map(|(index, part)| {
                let filename = part
                    .attachment_name()
                    .map(String::from)
                    .unwrap_or_else(|| format!("attachment-{}", index + 1));
                let content_type = part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                Attachment::new(filename, content_type, part.contents())
            })
            .collect::<Vec<_>>();

        let html = parsed.html_part(0).and_then(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        });

        let date = parsed
            .date()
            .and_then(|date| DateTime::from_timestamp(date.to_timestamp(), 0))
            .unwrap_or(received_at);

        let headers = match self.headers {
            HeaderMode::Include => Some(raw_headers(&parsed, raw)),
            HeaderMode::Omit => None,
        };

        let message = Message {
            message_id: parsed.message_id().unwrap_or_default().trim().to_string(),
            from: address_list(parsed.from()).unwrap_or_default(),
            to: address_list(parsed.to()).unwrap_or_default(),
            cc: address_list(parsed.cc()).filter(|cc| !cc.is_empty()),
            subject: parsed.subject().unwrap_or_default().to_string(),
            date,
            text: parsed
                .body_text(0)
                .map(|text| text.into_owned())
                .unwrap_or_default(),
            html,
            attachments: attachments.iter().map(Attachment::meta).collect(),
            headers,
        };

        Ok(ParsedMessage {
            message,
            attachments,
        })
    }
}

fn address_list(address: Option<&Address<'_>>) -> Option<AddressList> {
    address.map(|address| {
        AddressList::new(
            address
                .iter()
                .map(|addr| {
                    EmailAddress::new(
                        addr.address().unwrap_or_default(),
                        addr.name().unwrap_or_default(),
                    )
                })
                .collect(),
        )
    })
}

/// Builds the lower-cased header name to raw value mapping, repeated headers
/// are joined with a newline in order of appearance.
fn raw_headers(parsed: &mail_parser::Message<'_>, raw: &[u8]) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for header in parsed.headers() {
        let start = header.offset_start as usize;
        let end = header.offset_end as usize;
        let value = raw
            .get(start..end)
            .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
            .unwrap_or_default();
        headers
            .entry(header.name().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push('\n');
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    headers
}
