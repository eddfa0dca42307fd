//! Core message types shared by the ingestion pipeline, the store and the
//! HTTP API.
//!
//! This module defines [`Message`], the structured representation of a
//! captured email as returned to API callers, the [`Attachment`] payloads the
//! store keeps beside it, and [`Delivery`], the SMTP envelope plus raw bytes
//! handed over by a session once `DATA` completes.

use std::{collections::BTreeMap, net::IpAddr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single mailbox address with its optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailAddress {
    /// Bare address, `user@domain`.
    pub address: String,

    /// Display name, empty when the header carried none.
    pub name: String,
}

impl EmailAddress {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }

    /// Formats the address as `Name <address>`, or the bare address when
    /// there is no display name.
    pub fn display(&self) -> String {
        if self.name.is_empty() {
            self.address.clone()
        } else {
            format!("{} <{}>", self.name, self.address)
        }
    }
}

/// Address header value: the parsed addresses plus a printable rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressList {
    pub value: Vec<EmailAddress>,
    pub text: String,
}

impl AddressList {
    pub fn new(value: Vec<EmailAddress>) -> Self {
        let text = value
            .iter()
            .map(EmailAddress::display)
            .collect::<Vec<_>>()
            .join(", ");
        Self { value, text }
    }

    /// Returns whether any address in the list is exactly `address`.
    pub fn contains(&self, address: &str) -> bool {
        self.value.iter().any(|a| a.address == address)
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Attachment metadata as embedded in a [`Message`], without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
}

/// Attachment payload kept by the store, addressable only through its
/// parent message identifier and position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Arc<[u8]>,
}

impl Attachment {
    pub fn new(filename: String, content_type: String, content: &[u8]) -> Self {
        Self {
            filename,
            content_type,
            content: Arc::from(content),
        }
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Returns the payload-free view of this attachment.
    pub fn meta(&self) -> AttachmentMeta {
        AttachmentMeta {
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            size: self.size(),
        }
    }
}

/// One captured email.
///
/// Instances are immutable once handed to the store, readers only ever get
/// shared references to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message identifier, the `Message-ID` header without angle brackets.
    pub message_id: String,

    pub from: AddressList,

    pub to: AddressList,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<AddressList>,

    pub subject: String,

    /// `Date` header, or the delivery time when the header is missing.
    pub date: DateTime<Utc>,

    /// Plain text body.
    pub text: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,

    pub attachments: Vec<AttachmentMeta>,

    /// Raw header mapping, only populated in headers mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// A completed SMTP transaction, before parsing.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Envelope sender from `MAIL FROM`.
    pub envelope_from: String,

    /// Envelope recipients from `RCPT TO`, in the order given.
    pub envelope_to: Vec<String>,

    /// Message bytes exactly as received after dot-unstuffing.
    pub raw: Vec<u8>,

    /// Time at which the `DATA` phase completed.
    pub received_at: DateTime<Utc>,

    /// IP address of the connecting SMTP client.
    pub client_ip: Option<IpAddr>,

    /// HELO/EHLO domain presented by the connecting client.
    pub helo_domain: Option<String>,
}

impl Delivery {
    pub fn new(envelope_from: String, envelope_to: Vec<String>, raw: Vec<u8>) -> Self {
        Self {
            envelope_from,
            envelope_to,
            raw,
            received_at: Utc::now(),
            client_ip: None,
            helo_domain: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(
            EmailAddress::new("a@example.com", "").display(),
            "a@example.com"
        );
        assert_eq!(
            EmailAddress::new("a@example.com", "Alice").display(),
            "Alice <a@example.com>"
        );
    }

    #[test]
    fn test_address_list_text_and_contains() {
        let list = AddressList::new(vec![
            EmailAddress::new("a@example.com", "Alice"),
            EmailAddress::new("b@example.com", ""),
        ]);

        assert_eq!(list.text, "Alice <a@example.com>, b@example.com");
        assert!(list.contains("b@example.com"));
        assert!(!list.contains("B@example.com"));
        assert!(!list.contains("c@example.com"));
    }

    #[test]
    fn test_attachment_meta() {
        let attachment = Attachment::new(
            "report.pdf".to_string(),
            "application/pdf".to_string(),
            b"%PDF-1.4",
        );

        assert_eq!(
            attachment.meta(),
            AttachmentMeta {
                filename: "report.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                size: 8,
            }
        );
    }

    #[test]
    fn test_message_json_shape() {
        let message = Message {
            message_id: "abc@example.com".to_string(),
            from: AddressList::new(vec![EmailAddress::new("a@example.com", "Alice")]),
            to: AddressList::new(vec![EmailAddress::new("b@example.com", "")]),
            cc: None,
            subject: "Hello".to_string(),
            date: DateTime::from_timestamp(0, 0).unwrap(),
            text: "Body".to_string(),
            html: None,
            attachments: vec![AttachmentMeta {
                filename: "a.txt".to_string(),
                content_type: "text/plain".to_string(),
                size: 3,
            }],
            headers: None,
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["messageId"], "abc@example.com");
        assert_eq!(json["from"]["text"], "Alice <a@example.com>");
        assert_eq!(json["to"]["value"][0]["address"], "b@example.com");
        assert_eq!(json["attachments"][0]["contentType"], "text/plain");
        assert_eq!(json["date"], "1970-01-01T00:00:00Z");
        assert!(json.get("cc").is_none());
        assert!(json.get("html").is_none());
        assert!(json.get("headers").is_none());
        assert!(json["attachments"][0].get("content").is_none());
    }
}
