//! Outbound mail
//!
//! Delivery is best effort: `send_mail` never fails loudly, it reports a
//! [`MailResult`] and logs. Which transport is used comes from the `[mail]`
//! config section.

use crate::config::{MailConfig, MailTransportKind};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub address: String,
    pub name: Option<String>,
}

impl Recipient {
    pub fn new(address: &str, name: Option<&str>) -> Self {
        Self {
            address: address.trim().to_string(),
            name: name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string),
        }
    }

    fn mailbox(&self) -> String {
        mailbox(&self.address, self.name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct MailMessage {
    pub recipients: Vec<Recipient>,
    pub subject: String,
    pub body: String,
    /// Plain-text alternative, only used for HTML messages
    pub alt_body: Option<String>,
    pub is_html: bool,
    pub reply_to: Option<String>,
}

impl MailMessage {
    /// Copy with CR/LF removed from everything that ends up in a header
    fn sanitized(&self) -> Self {
        Self {
            recipients: self
                .recipients
                .iter()
                .map(|r| Recipient {
                    address: header_value(&r.address),
                    name: r.name.as_deref().map(header_value),
                })
                .collect(),
            subject: header_value(&self.subject),
            reply_to: self.reply_to.as_deref().map(header_value),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailResult {
    pub success: bool,
    pub error: Option<String>,
}

impl MailResult {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("message has no recipients")]
    NoRecipients,
    #[error("invalid recipient address {0:?}")]
    InvalidRecipient(String),
    #[error("mail is not configured (set [mail] transport in .poultrymetrics/config.toml)")]
    NotConfigured,
    #[error("could not run {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} exited with {status}: {stderr}")]
    Exit {
        path: String,
        status: String,
        stderr: String,
    },
}

/// A way of getting a message out of the building
pub trait MailTransport {
    fn name(&self) -> &'static str;

    fn send(&self, message: &MailMessage) -> Result<(), MailError>;
}

/// Sender identity written into the `From:` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub address: Option<String>,
    pub name: String,
}

/// Pipes messages into a sendmail-compatible binary (`-t -i`)
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    pub path: PathBuf,
    pub sender: Sender,
}

impl MailTransport for SendmailTransport {
    fn name(&self) -> &'static str {
        "sendmail"
    }

    fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        let path = self.path.display().to_string();
        let raw = render_message(&self.sender, message);

        let mut child = Command::new(&self.path)
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| MailError::Spawn {
                path: path.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(raw.as_bytes())
                .map_err(|source| MailError::Spawn {
                    path: path.clone(),
                    source,
                })?;
        }

        let output = child.wait_with_output().map_err(|source| MailError::Spawn {
            path: path.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(MailError::Exit {
                path,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Records messages in the log instead of sending them
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

impl MailTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        let to = message
            .recipients
            .iter()
            .map(Recipient::mailbox)
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(
            to = %to,
            subject = %message.subject,
            html = message.is_html,
            bytes = message.body.len(),
            "mail recorded, not delivered"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnconfiguredTransport;

impl MailTransport for UnconfiguredTransport {
    fn name(&self) -> &'static str {
        "none"
    }

    fn send(&self, _message: &MailMessage) -> Result<(), MailError> {
        Err(MailError::NotConfigured)
    }
}

pub fn transport_from_config(config: &MailConfig) -> Box<dyn MailTransport> {
    match config.transport {
        MailTransportKind::Sendmail => Box::new(SendmailTransport {
            path: config.sendmail_path.clone(),
            sender: Sender {
                address: config.from_address.clone(),
                name: config.from_name.clone(),
            },
        }),
        MailTransportKind::Log => Box::new(LogTransport),
        MailTransportKind::None => Box::new(UnconfiguredTransport),
    }
}

fn validate(message: &MailMessage) -> Result<(), MailError> {
    if message.recipients.is_empty() {
        return Err(MailError::NoRecipients);
    }
    for recipient in &message.recipients {
        let valid = recipient
            .address
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && !domain.is_empty())
            .unwrap_or(false);
        if !valid || recipient.address.contains(char::is_whitespace) {
            return Err(MailError::InvalidRecipient(recipient.address.clone()));
        }
    }
    Ok(())
}

/// Send one message; failures come back in the result and are logged
pub fn send_mail(transport: &dyn MailTransport, message: &MailMessage) -> MailResult {
    let message = message.sanitized();
    let sent = validate(&message).and_then(|()| transport.send(&message));
    match sent {
        Ok(()) => {
            tracing::debug!(transport = transport.name(), subject = %message.subject, "mail sent");
            MailResult::ok()
        }
        Err(e) => {
            tracing::warn!(transport = transport.name(), error = %e, "mail not sent");
            MailResult::failed(e)
        }
    }
}

fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ").trim().to_string()
}

/// UTF-8 bytes per encoded-word; 45 bytes of base64 keep each word under 75 chars
const ENCODED_WORD_BYTES: usize = 45;

/// Header text as-is when ASCII, otherwise as RFC 2047 `=?UTF-8?B?...?=`
/// words split on character boundaries and folded onto continuation lines
fn encode_header_text(text: &str) -> String {
    if text.is_ascii() {
        return text.to_string();
    }
    let mut chunks = vec![String::new()];
    for c in text.chars() {
        if let Some(last) = chunks.last_mut() {
            if !last.is_empty() && last.len() + c.len_utf8() > ENCODED_WORD_BYTES {
                chunks.push(String::new());
            }
        }
        if let Some(last) = chunks.last_mut() {
            last.push(c);
        }
    }
    chunks
        .iter()
        .map(|chunk| format!("=?UTF-8?B?{}?=", STANDARD.encode(chunk)))
        .collect::<Vec<_>>()
        .join("\r\n ")
}

fn mailbox(address: &str, name: Option<&str>) -> String {
    match name {
        Some(name) if !name.is_ascii() => format!("{} <{}>", encode_header_text(name), address),
        Some(name) => format!(
            "\"{}\" <{}>",
            name.replace('\\', "\\\\").replace('"', "\\\""),
            address
        ),
        None => address.to_string(),
    }
}

fn normalize_newlines(body: &str) -> String {
    body.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// RFC 5322 text handed to sendmail
pub fn render_message(sender: &Sender, message: &MailMessage) -> String {
    let mut headers = Vec::new();
    if let Some(address) = &sender.address {
        let name = header_value(&sender.name);
        headers.push(format!(
            "From: {}",
            mailbox(&header_value(address), (!name.is_empty()).then_some(name.as_str()))
        ));
    }
    let to = message
        .recipients
        .iter()
        .map(Recipient::mailbox)
        .collect::<Vec<_>>()
        .join(", ");
    headers.push(format!("To: {}", to));
    if let Some(reply_to) = &message.reply_to {
        headers.push(format!("Reply-To: {}", reply_to));
    }
    headers.push(format!("Subject: {}", encode_header_text(&message.subject)));
    headers.push(format!("Date: {}", chrono::Local::now().to_rfc2822()));
    headers.push("MIME-Version: 1.0".to_string());

    let body = match (&message.alt_body, message.is_html) {
        (Some(alt), true) => {
            let boundary = format!("pm-alt-{}", chrono::Utc::now().timestamp_micros());
            headers.push(format!(
                "Content-Type: multipart/alternative; boundary=\"{}\"",
                boundary
            ));
            format!(
                "--{b}\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\n{alt}\r\n\
                 --{b}\r\nContent-Type: text/html; charset=UTF-8\r\n\r\n{html}\r\n\
                 --{b}--\r\n",
                b = boundary,
                alt = normalize_newlines(alt),
                html = normalize_newlines(&message.body),
            )
        }
        (_, true) => {
            headers.push("Content-Type: text/html; charset=UTF-8".to_string());
            normalize_newlines(&message.body)
        }
        (_, false) => {
            headers.push("Content-Type: text/plain; charset=UTF-8".to_string());
            normalize_newlines(&message.body)
        }
    };

    format!("{}\r\n\r\n{}", headers.join("\r\n"), body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use std::cell::RefCell;

    /// Keeps what it was asked to send
    #[derive(Default)]
    struct Outbox {
        sent: RefCell<Vec<MailMessage>>,
    }

    impl MailTransport for Outbox {
        fn name(&self) -> &'static str {
            "outbox"
        }

        fn send(&self, message: &MailMessage) -> Result<(), MailError> {
            self.sent.borrow_mut().push(message.clone());
            Ok(())
        }
    }

    fn message(to: &str) -> MailMessage {
        MailMessage {
            recipients: vec![Recipient::new(to, Some("Farm Office"))],
            subject: "Weekly egg count".to_string(),
            body: "Total: 4200".to_string(),
            ..MailMessage::default()
        }
    }

    fn sender() -> Sender {
        Sender {
            address: Some("noreply@farm.example".to_string()),
            name: "PoultryMetrics".to_string(),
        }
    }

    #[test]
    fn test_send_through_transport() {
        let outbox = Outbox::default();
        let result = send_mail(&outbox, &message("office@farm.example"));
        assert_eq!(result, MailResult::ok());
        assert_eq!(outbox.sent.borrow().len(), 1);
    }

    #[test]
    fn test_rejects_bad_recipients() {
        let outbox = Outbox::default();

        let mut empty = message("office@farm.example");
        empty.recipients.clear();
        let result = send_mail(&outbox, &empty);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("message has no recipients"));

        for bad in ["office", "@farm.example", "office@", "off ice@farm.example"] {
            let result = send_mail(&outbox, &message(bad));
            assert!(!result.success, "{} should be rejected", bad);
        }
        assert!(outbox.sent.borrow().is_empty());
    }

    #[test]
    fn test_header_injection_is_stripped() {
        let outbox = Outbox::default();
        let mut msg = message("office@farm.example");
        msg.subject = "Report\r\nBcc: someone@elsewhere.example".to_string();
        msg.reply_to = Some("boss@farm.example\nX-Evil: 1".to_string());

        assert!(send_mail(&outbox, &msg).success);
        let sent = outbox.sent.borrow();
        assert_eq!(sent[0].subject, "Report  Bcc: someone@elsewhere.example");
        assert!(!sent[0].reply_to.as_deref().unwrap_or_default().contains('\n'));
    }

    #[test]
    fn test_unconfigured_transport_fails() {
        let result = send_mail(&UnconfiguredTransport, &message("office@farm.example"));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not configured"));
    }

    #[test]
    fn test_log_transport_succeeds() {
        assert!(send_mail(&LogTransport, &message("office@farm.example")).success);
    }

    #[test]
    fn test_missing_sendmail_binary_is_reported() {
        let transport = SendmailTransport {
            path: PathBuf::from("/nonexistent/poultrymetrics/sendmail"),
            sender: sender(),
        };
        let result = send_mail(&transport, &message("office@farm.example"));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("could not run"));
    }

    #[test]
    fn test_transport_from_config() {
        let mut config = MailConfig::default();
        assert_eq!(transport_from_config(&config).name(), "none");
        config.transport = MailTransportKind::Log;
        assert_eq!(transport_from_config(&config).name(), "log");
        config.transport = MailTransportKind::Sendmail;
        assert_eq!(transport_from_config(&config).name(), "sendmail");
    }

    #[test]
    fn test_render_plain_message() {
        let mut msg = message("office@farm.example");
        msg.reply_to = Some("boss@farm.example".to_string());
        msg.body = "line one\nline two".to_string();
        let raw = render_message(&sender(), &msg);

        assert!(raw.starts_with("From: \"PoultryMetrics\" <noreply@farm.example>\r\n"));
        assert!(raw.contains("To: \"Farm Office\" <office@farm.example>\r\n"));
        assert!(raw.contains("Reply-To: boss@farm.example\r\n"));
        assert!(raw.contains("Subject: Weekly egg count\r\n"));
        assert!(raw.contains("Content-Type: text/plain; charset=UTF-8\r\n\r\nline one\r\nline two"));
    }

    #[test]
    fn test_render_encodes_non_ascii_headers() {
        let mut msg = message("office@farm.example");
        msg.recipients = vec![Recipient::new("office@farm.example", Some("Granja Peñaflor"))];
        msg.subject = "Recuento semanal: Peñaflor".to_string();
        let raw = render_message(&sender(), &msg);

        let subject = format!("Subject: =?UTF-8?B?{}?=\r\n", STANDARD.encode("Recuento semanal: Peñaflor"));
        assert!(raw.contains(&subject), "{}", raw);
        let to = format!("To: =?UTF-8?B?{}?= <office@farm.example>\r\n", STANDARD.encode("Granja Peñaflor"));
        assert!(raw.contains(&to), "{}", raw);
        assert!(raw.split("\r\n\r\n").next().unwrap_or_default().is_ascii());
    }

    #[test]
    fn test_long_encoded_header_is_folded() {
        let text = "ñ".repeat(40);
        let encoded = encode_header_text(&text);
        let words: Vec<&str> = encoded.split("\r\n ").collect();
        assert_eq!(words.len(), 2);
        assert!(words.iter().all(|w| w.len() <= 75));

        let decoded: Vec<u8> = words
            .iter()
            .flat_map(|w| {
                let payload = w.trim_start_matches("=?UTF-8?B?").trim_end_matches("?=");
                STANDARD.decode(payload).unwrap()
            })
            .collect();
        assert_eq!(String::from_utf8(decoded).unwrap(), text);
        assert_eq!(encode_header_text("Weekly count"), "Weekly count");
    }

    #[test]
    fn test_display_name_quotes_are_escaped() {
        assert_eq!(
            mailbox("ada@farm.test", Some("Ada \"Hen Lady\" Obi")),
            "\"Ada \\\"Hen Lady\\\" Obi\" <ada@farm.test>"
        );
        assert_eq!(
            mailbox("ops@farm.test", Some("Shed\\Ops")),
            "\"Shed\\\\Ops\" <ops@farm.test>"
        );
    }

    #[test]
    fn test_render_html_with_alternative() {
        let mut msg = message("office@farm.example");
        msg.is_html = true;
        msg.body = "<p>Total: 4200</p>".to_string();
        msg.alt_body = Some("Total: 4200".to_string());
        let raw = render_message(&sender(), &msg);

        assert!(raw.contains("Content-Type: multipart/alternative; boundary=\"pm-alt-"));
        let plain = raw.find("text/plain").unwrap();
        let html = raw.find("text/html").unwrap();
        assert!(plain < html);
        assert!(raw.trim_end().ends_with("--"));
    }

    #[test]
    fn test_render_without_from_address() {
        let sender = Sender {
            address: None,
            name: "PoultryMetrics".to_string(),
        };
        let raw = render_message(&sender, &message("office@farm.example"));
        assert!(raw.starts_with("To: "));
    }
}
