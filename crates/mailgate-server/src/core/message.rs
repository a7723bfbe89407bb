//! RFC822 parsing: picks apart sender, subject, header names, the
//! effective body, and decoded attachments from a raw message.

use std::sync::OnceLock;

use mail_parser::{Message, MessageParser, MimeHeaders};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageParseError {
    #[error("message body is not valid RFC822")]
    MalformedRfc822,
}

pub struct ParsedEmail {
    pub from_address: Option<String>,
    pub subject: String,
    pub header_names: Vec<String>,
    /// Effective body per the body-processor rule: HTML if present, else text.
    pub effective_body: Option<String>,
    pub is_html: bool,
    pub attachments: Vec<DecodedAttachment>,
}

pub struct DecodedAttachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

fn message_parser() -> &'static MessageParser {
    static PARSER: OnceLock<MessageParser> = OnceLock::new();
    PARSER.get_or_init(MessageParser::default)
}

pub fn parse_email(raw: &[u8]) -> Result<ParsedEmail, MessageParseError> {
    let message: Message<'_> = message_parser().parse(raw).ok_or(MessageParseError::MalformedRfc822)?;

    let from_address = message
        .from()
        .and_then(|addrs| addrs.first())
        .and_then(|addr| addr.address())
        .map(str::to_string);

    let subject = message.subject().unwrap_or_default().to_string();

    let header_names: Vec<String> = message
        .headers()
        .iter()
        .map(|header| header.name().to_string())
        .collect();

    let html_body = message.html_bodies().next().map(|part| part.text_contents().unwrap_or_default().to_string());
    let text_body = message.text_bodies().next().map(|part| part.text_contents().unwrap_or_default().to_string());

    let (effective_body, is_html) = match html_body {
        Some(html) => (Some(html), true),
        None => (text_body, false),
    };

    let attachments = message
        .attachments()
        .map(|part| DecodedAttachment {
            file_name: part.attachment_name().unwrap_or("attachment.bin").to_string(),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            bytes: part.contents().to_vec(),
        })
        .collect();

    Ok(ParsedEmail {
        from_address,
        subject,
        header_names,
        effective_body,
        is_html,
        attachments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text_message() {
        let raw = b"From: sender@example.com\r\nSubject: Hello\r\n\r\nHi there";
        let parsed = parse_email(raw).expect("should parse");
        assert_eq!(parsed.from_address.as_deref(), Some("sender@example.com"));
        assert_eq!(parsed.subject, "Hello");
        assert!(!parsed.is_html);
        assert_eq!(parsed.effective_body.as_deref(), Some("Hi there"));
    }

    #[test]
    fn prefers_html_body_when_present() {
        let raw = b"From: a@example.com\r\nSubject: S\r\nContent-Type: multipart/alternative; boundary=XYZ\r\n\r\n--XYZ\r\nContent-Type: text/plain\r\n\r\nplain\r\n--XYZ\r\nContent-Type: text/html\r\n\r\n<html><body>html body</body></html>\r\n--XYZ--\r\n";
        let parsed = parse_email(raw).expect("should parse");
        assert!(parsed.is_html);
        assert!(parsed.effective_body.unwrap().contains("html body"));
    }
}
