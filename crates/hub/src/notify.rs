//! Outcome notifications. Mail goes out over SMTP with STARTTLS; credentials
//! and addresses are read from the watering settings at send time.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lettre::address::AddressError;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigProvider, Settings, EMAIL_FROM, EMAIL_PASSWORD, EMAIL_TO, EMAIL_USER};

const SENDER_NAME: &str = "Watering system";

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(String),
    /// Path to an image to attach instead of inline text.
    Attachment(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: Body,
    /// Deliver to the first recipient only.
    pub debug: bool,
}

impl Notification {
    pub fn text(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: Body::Text(body.into()),
            debug: false,
        }
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("mail setting '{0}' is missing")]
    MissingSetting(&'static str),
    #[error("invalid mail address: {0}")]
    Address(#[from] AddressError),
    #[error("no recipients configured")]
    NoRecipients,
    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Delivers notifications to the configured recipients.
pub trait Notifier: Send + Sync + 'static {
    fn send(&self, notification: &Notification) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

// ---------------------------------------------------------------------------
// SMTP
// ---------------------------------------------------------------------------

pub struct MailNotifier<C> {
    config: C,
    host: String,
    port: u16,
    timeout: Duration,
}

impl<C: ConfigProvider> MailNotifier<C> {
    pub fn new(config: C, host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            config,
            host: host.into(),
            port,
            timeout,
        }
    }
}

impl<C: ConfigProvider> Notifier for MailNotifier<C> {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let settings = self.config.load();
        let user = require(&settings, EMAIL_USER)?;
        let password = require(&settings, EMAIL_PASSWORD)?;

        let content = match &notification.body {
            Body::Text(text) => MailContent::Text(text.clone()),
            Body::Attachment(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|source| NotifyError::Attachment {
                        path: path.clone(),
                        source,
                    })?;
                MailContent::File {
                    name: file_name(path),
                    bytes,
                }
            }
        };
        let message = build_message(&settings, notification, content)?;
        debug!(subject = %notification.subject, "sending mail");

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)?
            .port(self.port)
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .timeout(Some(self.timeout))
            .build();
        transport.send(message).await?;

        info!(subject = %notification.subject, "mail sent");
        Ok(())
    }
}

/// Resolved mail body.
pub enum MailContent {
    Text(String),
    File { name: String, bytes: Vec<u8> },
}

/// Assemble the mail: sender, recipients (first only in debug mode),
/// subject and a single body part.
pub fn build_message(
    settings: &Settings,
    notification: &Notification,
    content: MailContent,
) -> Result<Message, NotifyError> {
    let from = Mailbox::new(
        Some(SENDER_NAME.to_string()),
        require(settings, EMAIL_FROM)?.trim().parse()?,
    );
    let mut recipients = recipients(require(settings, EMAIL_TO)?)?;
    if notification.debug {
        recipients.truncate(1);
    }
    if recipients.is_empty() {
        return Err(NotifyError::NoRecipients);
    }

    let part = match content {
        MailContent::Text(text) => SinglePart::plain(text),
        MailContent::File { name, bytes } => {
            let content_type = attachment_type(&name);
            Attachment::new(name).body(bytes, content_type)
        }
    };

    let mut builder = Message::builder().from(from).subject(notification.subject.clone());
    for to in recipients {
        builder = builder.to(to);
    }
    Ok(builder.multipart(MultiPart::mixed().singlepart(part))?)
}

/// Comma-separated address list; blank entries are ignored.
pub fn recipients(list: &str) -> Result<Vec<Mailbox>, NotifyError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Mailbox>().map_err(NotifyError::from))
        .collect()
}

fn require<'a>(settings: &'a Settings, key: &'static str) -> Result<&'a str, NotifyError> {
    settings
        .get(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(NotifyError::MissingSetting(key))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string())
}

fn attachment_type(name: &str) -> ContentType {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    let mime = match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    };
    ContentType::parse(mime).unwrap_or(ContentType::TEXT_PLAIN)
}

// ===========================================================================
// Tests
// ===========================================================================
