//! Outbound mail for OOPS and user-error notifications.
//!
//! An empty recipient list means no message is composed or sent.

use std::sync::{Arc, Mutex};

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{Message, SendmailTransport, Transport};

use crate::error::{Result, RunnerError};
use crate::oops::OopsReport;
use crate::runnable::JobError;

const WRAP_WIDTH: usize = 72;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

pub trait Mailer: Send + Sync {
    fn send(&self, message: &MailMessage) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<MailMessage>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Mailer for MemoryMailer {
    fn send(&self, message: &MailMessage) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        Ok(())
    }
}

/// Logs messages instead of delivering them. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, message: &MailMessage) -> Result<()> {
        tracing::info!(
            to = %message.to.join(", "),
            subject = %message.subject,
            "Not sending mail (dry run)"
        );
        Ok(())
    }
}

/// Delivers messages through a local `sendmail` binary.
#[derive(Debug, Clone)]
pub struct SendmailMailer {
    program: String,
}

impl Default for SendmailMailer {
    fn default() -> Self {
        Self {
            program: "sendmail".to_string(),
        }
    }
}

impl SendmailMailer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Mailer for SendmailMailer {
    fn send(&self, message: &MailMessage) -> Result<()> {
        let email = build_message(message)?;
        SendmailTransport::new_with_command(&self.program)
            .send(&email)
            .map_err(|e| RunnerError::Mail(format!("{}: {e}", self.program)))
    }
}

fn build_message(message: &MailMessage) -> Result<Message> {
    let mut builder = Message::builder()
        .from(mailbox(&message.from)?)
        .subject(single_line(&message.subject))
        .header(ContentType::TEXT_PLAIN);
    for recipient in &message.to {
        builder = builder.to(mailbox(recipient)?);
    }
    builder
        .body(message.body.clone())
        .map_err(|e| RunnerError::Mail(e.to_string()))
}

fn mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse()
        .map_err(|e| RunnerError::Mail(format!("invalid address {address:?}: {e}")))
}

/// Header values never span lines.
fn single_line(text: &str) -> String {
    text.split(|c: char| c == '\r' || c == '\n')
        .filter(|part| !part.trim().is_empty())
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Composes notification messages and hands them to a [`Mailer`].
#[derive(Clone)]
pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    from_address: String,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, from_address: impl Into<String>) -> Self {
        Self {
            mailer,
            from_address: from_address.into(),
        }
    }

    /// Returns `true` if a message was sent.
    pub fn notify_oops(
        &self,
        recipients: &[String],
        operation: &str,
        report: &OopsReport,
    ) -> Result<bool> {
        if recipients.is_empty() {
            return Ok(false);
        }
        let body = wrap(&format!(
            "The job runner encountered an internal error during the following \
             operation: {operation}. It was logged with id {}. Sorry for the \
             inconvenience.",
            report.id
        ));
        self.send(recipients, "Job runner internal error".to_string(), body)?;
        Ok(true)
    }

    /// Returns `true` if a message was sent.
    pub fn notify_user_error(
        &self,
        recipients: &[String],
        operation: &str,
        err: &JobError,
    ) -> Result<bool> {
        if recipients.is_empty() {
            return Ok(false);
        }
        self.send(
            recipients,
            format!("Error while {operation}"),
            wrap(err.message()),
        )?;
        Ok(true)
    }

    fn send(&self, recipients: &[String], subject: String, body: String) -> Result<()> {
        let message = MailMessage {
            from: self.from_address.clone(),
            to: recipients.to_vec(),
            subject,
            body,
        };
        self.mailer.send(&message)
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("from_address", &self.from_address)
            .finish()
    }
}

/// Greedy word wrap. Paragraph breaks are kept.
fn wrap(text: &str) -> String {
    text.split("\n\n")
        .map(|paragraph| {
            let mut lines = Vec::new();
            let mut line = String::new();
            for word in paragraph.split_whitespace() {
                if !line.is_empty() && line.len() + 1 + word.len() > WRAP_WIDTH {
                    lines.push(std::mem::take(&mut line));
                }
                if !line.is_empty() {
                    line.push(' ');
                }
                line.push_str(word);
            }
            if !line.is_empty() {
                lines.push(line);
            }
            lines.join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::FailureKind;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn notifier() -> (Notifier, Arc<MemoryMailer>) {
        let mailer = Arc::new(MemoryMailer::new());
        (Notifier::new(mailer.clone(), "noreply@example.com"), mailer)
    }

    #[test]
    fn no_recipients_means_no_mail() {
        let (notifier, mailer) = notifier();
        let err = JobError::new(FailureKind::new("UsageError"), "bad branch name");

        assert!(!notifier.notify_user_error(&[], "importing", &err).unwrap());
        assert!(mailer.sent().is_empty());
    }

    #[test]
    fn user_error_mail_has_operation_in_subject() {
        let (notifier, mailer) = notifier();
        let err = JobError::new(FailureKind::new("UsageError"), "bad branch name");

        let sent = notifier
            .notify_user_error(&["owner@example.com".into()], "importing a branch", &err)
            .unwrap();

        assert!(sent);
        let mail = &mailer.sent()[0];
        assert_eq!(mail.subject, "Error while importing a branch");
        assert_eq!(mail.body, "bad branch name");
        assert_eq!(mail.from, "noreply@example.com");
    }

    #[test]
    fn oops_mail_references_report_id() {
        let (notifier, mailer) = notifier();
        let report = OopsReport {
            id: "OOPS-42".into(),
            kind: "ValueError".into(),
            value: "boom".into(),
            chain: vec![],
            time: Utc::now(),
            reporter: "tests".into(),
            operation: None,
            vars: BTreeMap::new(),
        };

        notifier
            .notify_oops(&["ops@example.com".into()], "building a recipe", &report)
            .unwrap();

        let mail = &mailer.sent()[0];
        assert!(mail.body.contains("OOPS-42"));
        let flat = mail.body.split_whitespace().collect::<Vec<_>>().join(" ");
        assert!(flat.contains("operation: building a recipe."));
    }

    #[test]
    fn subject_is_folded_onto_one_line() {
        assert_eq!(
            single_line("Error while x\r\nBcc: someone@example.org"),
            "Error while x Bcc: someone@example.org"
        );
        assert_eq!(single_line("plain"), "plain");
    }

    #[test]
    fn invalid_address_is_a_mail_error() {
        let message = MailMessage {
            from: "noreply@example.com".into(),
            to: vec!["not an address".into()],
            subject: "hello".into(),
            body: "hi".into(),
        };
        assert!(matches!(build_message(&message), Err(RunnerError::Mail(_))));
    }

    #[cfg(unix)]
    #[test]
    fn sendmail_delivery_keeps_headers_intact() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("sendmail");
        std::fs::write(&program, "#!/bin/sh\ncat > \"$0.out\"\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mailer = SendmailMailer::new(program.display().to_string());
        mailer
            .send(&MailMessage {
                from: "noreply@example.com".into(),
                to: vec!["owner@example.com".into()],
                subject: "Error while x\nBcc: someone@example.org".into(),
                body: "details".into(),
            })
            .unwrap();

        let delivered = std::fs::read_to_string(dir.path().join("sendmail.out")).unwrap();
        let headers: Vec<&str> = delivered.split("\r\n\r\n").next().unwrap().lines().collect();
        assert!(headers.iter().any(|line| line.starts_with("Subject:")));
        assert!(headers.iter().any(|line| line.contains("owner@example.com")));
        assert!(!headers
            .iter()
            .any(|line| line.to_ascii_lowercase().starts_with("bcc:")));
        assert!(delivered.contains("details"));
    }

    #[cfg(unix)]
    #[test]
    fn sendmail_failure_is_reported() {
        let mailer = SendmailMailer::new("false");
        let err = mailer
            .send(&MailMessage {
                from: "noreply@example.com".into(),
                to: vec!["owner@example.com".into()],
                subject: "hello".into(),
                body: "hi".into(),
            })
            .unwrap_err();
        assert!(matches!(err, RunnerError::Mail(_)));
    }

    #[test]
    fn wrap_breaks_long_lines() {
        let text = "word ".repeat(40);
        for line in wrap(&text).lines() {
            assert!(line.len() <= WRAP_WIDTH);
        }
    }
}
