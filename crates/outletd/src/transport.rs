//! Outbound delivery seams. The dispatcher and campaign workers only
//! know about [`MailTransport`]; behind it sits either a pool of SMTP
//! sessions or a cloud send API, and the error classification drives
//! the retry policy: transient failures are retried with backoff,
//! permanent ones are not, and an unconfigured transport fails the
//! operation immediately since retrying cannot help.

use async_trait::async_trait;
use smtp_relay::{ClientError, Pool, PoolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
    #[error("no outbound transport is configured")]
    NotConfigured,
}

/// A fully rendered message plus its envelope. Empty from/reply-to
/// fields fall back to the transport's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct RenderedMail {
    pub from_name: String,
    pub from_email: String,
    pub reply_to: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub list_unsubscribe: Option<String>,
}

#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    async fn send(&self, mail: &RenderedMail) -> Result<(), TransportError>;
}

/// Assemble the RFC822 message bytes for an HTML mail.
pub fn build_message(mail: &RenderedMail) -> Vec<u8> {
    let mut headers = format!("From: {} <{}>\r\n", mail.from_name, mail.from_email);
    headers.push_str(&format!("To: {}\r\n", mail.to));
    if !mail.reply_to.is_empty() {
        headers.push_str(&format!("Reply-To: {}\r\n", mail.reply_to));
    }
    headers.push_str(&format!("Subject: {}\r\n", mail.subject));
    if let Some(url) = &mail.list_unsubscribe {
        headers.push_str(&format!("List-Unsubscribe: <{url}>\r\n"));
    }
    headers.push_str("MIME-Version: 1.0\r\n");
    headers.push_str("Content-Type: text/html; charset=UTF-8\r\n");
    headers.push_str("\r\n");

    let mut message = headers.into_bytes();
    message.extend_from_slice(mail.html.as_bytes());
    message
}

fn classify_pool_error(err: PoolError) -> TransportError {
    match err {
        PoolError::Client(ClientError::Rejected { ref response, .. }) => {
            if response.is_permanent() {
                TransportError::Permanent(err.to_string())
            } else {
                TransportError::Transient(err.to_string())
            }
        }
        // I/O trouble on a session is worth another attempt.
        PoolError::Client(_) | PoolError::Closed => TransportError::Transient(err.to_string()),
        // All sessions busy: fail this item now instead of blocking
        // the worker indefinitely.
        PoolError::Exhausted(_) => TransportError::Permanent(err.to_string()),
    }
}

/// Delivery through a bounded pool of authenticated SMTP sessions.
pub struct SmtpRelayTransport {
    pool: Pool,
    from_name: String,
    from_email: String,
    reply_to: String,
}

impl SmtpRelayTransport {
    pub fn new(pool: Pool, from_name: String, from_email: String, reply_to: String) -> Self {
        Self {
            pool,
            from_name,
            from_email,
            reply_to,
        }
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

#[async_trait]
impl MailTransport for SmtpRelayTransport {
    async fn send(&self, mail: &RenderedMail) -> Result<(), TransportError> {
        let mut mail = mail.clone();
        if mail.from_email.is_empty() {
            mail.from_email = self.from_email.clone();
        }
        if mail.from_name.is_empty() {
            mail.from_name = self.from_name.clone();
        }
        if mail.reply_to.is_empty() {
            mail.reply_to = self.reply_to.clone();
        }
        if mail.from_email.is_empty() {
            return Err(TransportError::NotConfigured);
        }

        let message = build_message(&mail);
        self.pool
            .send_mail(&mail.from_email, &[mail.to.clone()], &message)
            .await
            .map_err(classify_pool_error)
    }
}

/// Delivery through a cloud send API: one JSON POST per message,
/// authenticated with a bearer credential.
pub struct HttpApiTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from_name: String,
    from_email: String,
    reply_to: String,
}

impl HttpApiTransport {
    pub fn new(
        endpoint: String,
        api_key: String,
        from_name: String,
        from_email: String,
        reply_to: String,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            from_name,
            from_email,
            reply_to,
        }
    }
}

#[async_trait]
impl MailTransport for HttpApiTransport {
    async fn send(&self, mail: &RenderedMail) -> Result<(), TransportError> {
        let from_email = if mail.from_email.is_empty() {
            &self.from_email
        } else {
            &mail.from_email
        };
        let from_name = if mail.from_name.is_empty() {
            &self.from_name
        } else {
            &mail.from_name
        };
        let reply_to = if mail.reply_to.is_empty() {
            &self.reply_to
        } else {
            &mail.reply_to
        };
        if from_email.is_empty() {
            return Err(TransportError::NotConfigured);
        }

        let body = serde_json::json!({
            "from": format!("{from_name} <{from_email}>"),
            "reply_to": reply_to,
            "to": [mail.to],
            "subject": mail.subject,
            "html": mail.html,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| TransportError::Transient(format!("send API request: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(TransportError::Permanent(format!(
                "send API rejected the message ({status}): {detail}"
            )))
        } else {
            Err(TransportError::Transient(format!(
                "send API error ({status}): {detail}"
            )))
        }
    }
}

/// Placeholder transport used when neither SMTP relay nor send API
/// settings are present.
pub struct Unconfigured;

#[async_trait]
impl MailTransport for Unconfigured {
    async fn send(&self, _mail: &RenderedMail) -> Result<(), TransportError> {
        Err(TransportError::NotConfigured)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use smtp_relay::Response;

    #[test]
    fn message_assembly() {
        let mail = RenderedMail {
            from_name: "Outlet".to_string(),
            from_email: "news@example.com".to_string(),
            reply_to: "support@example.com".to_string(),
            to: "ada@example.org".to_string(),
            subject: "Hello".to_string(),
            html: "<p>hi</p>".to_string(),
            list_unsubscribe: Some("https://outlet.example/api/e/u/tok".to_string()),
        };
        let message = String::from_utf8(build_message(&mail)).unwrap();
        assert!(message.starts_with("From: Outlet <news@example.com>\r\n"));
        assert!(message.contains("To: ada@example.org\r\n"));
        assert!(message.contains("Reply-To: support@example.com\r\n"));
        assert!(message.contains("List-Unsubscribe: <https://outlet.example/api/e/u/tok>\r\n"));
        assert!(message.contains("Content-Type: text/html; charset=UTF-8\r\n"));
        assert!(message.ends_with("\r\n\r\n<p>hi</p>"));
    }

    #[test]
    fn transactional_mail_has_no_list_unsubscribe() {
        let mail = RenderedMail {
            from_name: "Outlet".to_string(),
            from_email: "news@example.com".to_string(),
            to: "ada@example.org".to_string(),
            subject: "Receipt".to_string(),
            html: "<p>paid</p>".to_string(),
            ..RenderedMail::default()
        };
        let message = String::from_utf8(build_message(&mail)).unwrap();
        assert!(!message.contains("List-Unsubscribe"));
    }

    #[test]
    fn pool_error_classification() {
        let rejected = |code| {
            PoolError::Client(ClientError::Rejected {
                command: "RCPT TO",
                response: Response {
                    code,
                    message: "nope".to_string(),
                },
            })
        };

        assert!(matches!(
            classify_pool_error(rejected(550)),
            TransportError::Permanent(_)
        ));
        assert!(matches!(
            classify_pool_error(rejected(451)),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_pool_error(PoolError::Client(ClientError::TimedOut)),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_pool_error(PoolError::Exhausted(10)),
            TransportError::Permanent(_)
        ));
    }
}
