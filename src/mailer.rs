use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{error, info};

use crate::config::EmailConfig;
use crate::error::MailError;

/// SMTP delivery of the rendered report over STARTTLS.
pub struct Mailer {
    config: EmailConfig,
}

impl Mailer {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    /// Send an HTML message with a plain-text alternative. Delivery is attempted once.
    pub async fn send(&self, subject: &str, html: &str) -> Result<(), MailError> {
        let message = self.build_message(subject, html)?;
        let config = self.config.clone();
        let recipient = config.recipient.clone();

        let result = tokio::task::spawn_blocking(move || -> Result<(), MailError> {
            let transport = SmtpTransport::starttls_relay(&config.smtp_host)
                .map_err(|e| MailError::Send(format!("smtp starttls relay init failed: {e}")))?
                .port(config.smtp_port)
                .credentials(Credentials::new(config.username.clone(), config.password.clone()))
                .build();
            transport.send(&message).map(|_| ()).map_err(|e| MailError::Send(e.to_string()))
        })
        .await
        .map_err(|e| MailError::Send(format!("mail task failed: {e}")))?;

        match &result {
            Ok(()) => info!(recipient = %recipient, subject = %subject, "report email sent"),
            Err(e) => error!(recipient = %recipient, error = %e, "failed to send report email"),
        }
        result
    }

    fn build_message(&self, subject: &str, html: &str) -> Result<Message, MailError> {
        let from = mailbox(&self.config.sender)?;
        let to = mailbox(&self.config.recipient)?;
        let plain = html2text::from_read(html.as_bytes(), 100).unwrap_or_else(|_| html.to_string());

        Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(plain, html.to_string()))
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

fn mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.parse().map_err(|e: lettre::address::AddressError| MailError::Address {
        address: address.to_string(),
        message: e.to_string(),
    })
}
