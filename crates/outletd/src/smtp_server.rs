//! SMTP ingress: applications submit transactional mail with ordinary
//! SMTP, authenticating with a tenant credential via AUTH PLAIN.
//! Accepted messages are parsed, X-Outlet-* headers are lifted out,
//! tracking is applied, and delivery happens inline through the
//! outbound transport, one send per recipient.

use crate::metrics;
use crate::render::{tracking_token, Renderer};
use crate::transport::{MailTransport, RenderedMail};
use anyhow::anyhow;
use chrono::Utc;
use data_encoding::BASE64;
use mailparse::{MailHeader, MailHeaderMap, ParsedMail};
use parking_lot::Mutex;
use sendq::{EmailStatus, MessageType, QueueStore, Tenant, TransactionalSend};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SmtpServerConfig {
    pub listen: String,
    /// Hostname announced in the greeting and EHLO response.
    pub hostname: String,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
}

impl Default for SmtpServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2525".to_string(),
            hostname: "outlet.local".to_string(),
            max_message_bytes: 10 * 1024 * 1024,
            max_recipients: 50,
        }
    }
}

pub struct SmtpIngress {
    deps: Arc<IngressDeps>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct IngressDeps {
    config: SmtpServerConfig,
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn MailTransport>,
    renderer: Renderer,
}

impl SmtpIngress {
    pub fn new(
        config: SmtpServerConfig,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn MailTransport>,
        renderer: Renderer,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            deps: Arc::new(IngressDeps {
                config,
                store,
                transport,
                renderer,
            }),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.deps.config.listen).await?;
        tracing::info!("SMTP ingress listening on {}", self.deps.config.listen);
        let deps = self.deps.clone();
        let mut stop = self.stop_tx.subscribe();
        *self.task.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            tracing::debug!("ingress connection from {peer}");
                            let deps = deps.clone();
                            tokio::spawn(async move {
                                let mut session = IngressSession::new(socket, deps);
                                if let Err(err) = session.process().await {
                                    tracing::debug!("ingress session from {peer} ended: {err:#}");
                                }
                            });
                        }
                        Err(err) => error!("ingress accept failed: {err}"),
                    }
                }
            }
        }));
        Ok(())
    }

    pub async fn stop(&self) {
        self.stop_tx.send(true).ok();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.ok();
        }
        tracing::info!("SMTP ingress stopped");
    }
}

struct IngressSession<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: BufWriter<WriteHalf<T>>,
    deps: Arc<IngressDeps>,
    tenant: Option<Tenant>,
    sender: Option<String>,
    recipients: Vec<String>,
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> IngressSession<T> {
    fn new(socket: T, deps: Arc<IngressDeps>) -> Self {
        let (reader, writer) = tokio::io::split(socket);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            deps,
            tenant: None,
            sender: None,
            recipients: vec![],
        }
    }

    async fn write_response<S: AsRef<str>>(
        &mut self,
        status: u16,
        message: S,
    ) -> anyhow::Result<()> {
        let message = message.as_ref();
        let mut lines = message.lines().peekable();
        if lines.peek().is_none() {
            self.writer.write_all(format!("{status} \r\n").as_bytes()).await?;
        }
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            let sep = if is_last { ' ' } else { '-' };
            let text = format!("{status}{sep}{line}\r\n");
            self.writer.write_all(text.as_bytes()).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> anyhow::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            anyhow::bail!("connection closed");
        }
        Ok(line)
    }

    fn reset(&mut self) {
        self.sender.take();
        self.recipients.clear();
    }

    async fn process(&mut self) -> anyhow::Result<()> {
        let hostname = self.deps.config.hostname.clone();
        self.write_response(220, format!("{hostname} Outlet ESMTP"))
            .await?;
        loop {
            let line = self.read_line().await?;
            let line = line.trim_end();

            match Command::parse(line) {
                Err(err) => {
                    self.write_response(
                        501,
                        format!("Syntax error in command or arguments: {err}"),
                    )
                    .await?;
                }
                Ok(Command::Quit) => {
                    self.write_response(221, format!("{hostname} closing connection"))
                        .await?;
                    return Ok(());
                }
                Ok(Command::Ehlo(domain)) => {
                    self.write_response(
                        250,
                        format!(
                            "{hostname} Hello {domain}\nSIZE {}\nAUTH PLAIN",
                            self.deps.config.max_message_bytes
                        ),
                    )
                    .await?;
                }
                Ok(Command::Helo(domain)) => {
                    self.write_response(250, format!("Hello {domain}!")).await?;
                }
                Ok(Command::Auth { mechanism, initial }) => {
                    self.handle_auth(&mechanism, initial).await?;
                }
                Ok(Command::Mail(address)) => {
                    if self.tenant.is_none() {
                        self.write_response(530, "Authentication required").await?;
                        continue;
                    }
                    if self.sender.is_some() {
                        self.write_response(503, "MAIL FROM already issued; you must RSET first")
                            .await?;
                        continue;
                    }
                    self.sender.replace(address.clone());
                    self.write_response(250, format!("OK {address}")).await?;
                }
                Ok(Command::Rcpt(address)) => {
                    if self.tenant.is_none() {
                        self.write_response(530, "Authentication required").await?;
                        continue;
                    }
                    if self.sender.is_none() {
                        self.write_response(503, "MAIL FROM must be issued first")
                            .await?;
                        continue;
                    }
                    if self.recipients.len() >= self.deps.config.max_recipients {
                        self.write_response(452, "Too many recipients").await?;
                        continue;
                    }
                    self.write_response(250, format!("OK {address}")).await?;
                    self.recipients.push(address);
                }
                Ok(Command::Data) => {
                    if self.tenant.is_none() {
                        self.write_response(530, "Authentication required").await?;
                        continue;
                    }
                    if self.sender.is_none() {
                        self.write_response(503, "MAIL FROM must be issued first")
                            .await?;
                        continue;
                    }
                    if self.recipients.is_empty() {
                        self.write_response(503, "RCPT TO must be issued first")
                            .await?;
                        continue;
                    }
                    self.write_response(354, "Send body; end with CRLF.CRLF")
                        .await?;

                    let mut data = vec![];
                    let mut oversize = false;
                    loop {
                        let line = self.read_line().await?;
                        // Some clients terminate with a bare LF.
                        if line == ".\r\n" || line == ".\n" {
                            break;
                        }
                        let line = if line.starts_with('.') {
                            &line[1..]
                        } else {
                            &line
                        };
                        if data.len() + line.len() > self.deps.config.max_message_bytes {
                            // Keep draining to the terminator so the
                            // session stays in sync.
                            oversize = true;
                        } else {
                            data.extend_from_slice(line.as_bytes());
                        }
                    }

                    if oversize {
                        self.write_response(552, "Message exceeds maximum size")
                            .await?;
                        self.reset();
                        continue;
                    }

                    match self.accept_message(data).await {
                        Ok(token) => {
                            self.write_response(250, format!("OK id={token}")).await?;
                        }
                        Err(err) => {
                            error!("failed to process submitted message: {err:#}");
                            self.write_response(451, "Failed to process message")
                                .await?;
                        }
                    }
                    self.reset();
                }
                Ok(Command::Rset) => {
                    self.reset();
                    self.write_response(250, "Reset state").await?;
                }
                Ok(Command::Noop) => {
                    self.write_response(250, "OK").await?;
                }
                Ok(Command::Unknown(cmd)) => {
                    self.write_response(502, format!("Command unrecognized/unimplemented: {cmd}"))
                        .await?;
                }
            }
        }
    }

    async fn handle_auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> anyhow::Result<()> {
        if self.tenant.is_some() {
            return self.write_response(503, "Already authenticated").await;
        }
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return self
                .write_response(504, "Unrecognized authentication type")
                .await;
        }
        let payload = match initial {
            Some(payload) => payload,
            None => {
                self.write_response(334, "").await?;
                self.read_line().await?.trim_end().to_string()
            }
        };
        if payload == "*" {
            return self.write_response(501, "Authentication cancelled").await;
        }
        let Some((_authcid, credential)) = parse_auth_plain(&payload) else {
            return self
                .write_response(501, "Malformed AUTH PLAIN response")
                .await;
        };
        match self.deps.store.tenant_by_credential(&credential).await? {
            Some(tenant) => {
                tracing::info!("ingress authenticated tenant {}", tenant.name);
                self.tenant.replace(tenant);
                self.write_response(235, "Authentication succeeded").await
            }
            None => {
                metrics::INGRESS_AUTH_FAILURES.inc();
                tracing::warn!("ingress authentication failed");
                self.write_response(535, "Authentication credentials invalid")
                    .await
            }
        }
    }

    async fn accept_message(&mut self, data: Vec<u8>) -> anyhow::Result<String> {
        let tenant = self
            .tenant
            .clone()
            .ok_or_else(|| anyhow!("not authenticated"))?;
        let sender = self.sender.clone().unwrap_or_default();
        let parsed = mailparse::parse_mail(&data)?;

        let subject = parsed
            .headers
            .get_first_value("Subject")
            .filter(|subject| !subject.is_empty())
            .unwrap_or_else(|| "(No Subject)".to_string());
        let headers = OutletHeaders::parse(&parsed.headers);
        let (html, plain) = extract_body(&parsed);
        let html = if !html.is_empty() {
            html
        } else if !plain.trim().is_empty() {
            format!("<pre>{plain}</pre>")
        } else {
            anyhow::bail!("message has no usable body");
        };

        let token = tracking_token();
        let recipients = self.recipients.clone();
        for recipient in &recipients {
            if let Err(err) = self
                .deliver(&tenant, &sender, recipient, &subject, &html, &headers, &token)
                .await
            {
                // One bad recipient does not poison the rest.
                error!("ingress delivery to {recipient} failed: {err:#}");
            }
        }
        metrics::INGRESS_MESSAGES.inc();
        tracing::info!(
            "accepted message from {sender} for {} recipient(s), id={token}",
            recipients.len()
        );
        Ok(token)
    }

    async fn deliver(
        &self,
        tenant: &Tenant,
        sender: &str,
        recipient: &str,
        subject: &str,
        html: &str,
        headers: &OutletHeaders,
        token: &str,
    ) -> anyhow::Result<()> {
        let record = TransactionalSend {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
            tracking_token: token.to_string(),
            message_type: headers.message_type,
            track_opens: headers.track_opens,
            track_clicks: headers.track_clicks,
            list: headers.list.clone(),
            template: headers.template.clone(),
            tags: headers.tags.clone(),
            metadata: headers.meta.clone(),
            status: EmailStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
        };
        let id = record.id;
        self.deps.store.insert_transactional_send(record).await?;

        let renderer = &self.deps.renderer;
        let mut body = html.to_string();
        if headers.track_clicks {
            body = renderer.rewrite_links(&body, token);
        }
        if headers.track_opens {
            body = renderer.inject_pixel(&body, token);
        }
        let marketing = headers.message_type == MessageType::Marketing;
        let from_email = if tenant.from_email.is_empty() {
            sender.to_string()
        } else {
            tenant.from_email.clone()
        };
        let mail = RenderedMail {
            from_name: tenant.from_name.clone(),
            from_email,
            reply_to: tenant.reply_to.clone(),
            to: recipient.to_string(),
            subject: subject.to_string(),
            html: body,
            list_unsubscribe: marketing.then(|| renderer.unsubscribe_url(token)),
        };
        match self.deps.transport.send(&mail).await {
            Ok(()) => {
                self.deps
                    .store
                    .update_transactional_status(id, EmailStatus::Sent, None)
                    .await?;
                Ok(())
            }
            Err(err) => {
                self.deps
                    .store
                    .update_transactional_status(id, EmailStatus::Failed, Some(&err.to_string()))
                    .await?;
                Err(err.into())
            }
        }
    }
}

/// Decode the PLAIN SASL payload: authzid NUL authcid NUL password.
fn parse_auth_plain(payload: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(payload.as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let mut fields = decoded.split('\0');
    let _authzid = fields.next()?;
    let authcid = fields.next()?;
    let password = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    Some((authcid.to_string(), password.to_string()))
}

/// The X-Outlet-* submission controls, with their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct OutletHeaders {
    pub list: Option<String>,
    pub tags: Vec<String>,
    pub template: Option<String>,
    pub message_type: MessageType,
    pub track_opens: bool,
    pub track_clicks: bool,
    pub meta: HashMap<String, String>,
}

impl Default for OutletHeaders {
    fn default() -> Self {
        Self {
            list: None,
            tags: vec![],
            template: None,
            message_type: MessageType::Transactional,
            track_opens: true,
            track_clicks: true,
            meta: HashMap::new(),
        }
    }
}

impl OutletHeaders {
    pub fn parse(headers: &[MailHeader]) -> Self {
        const META_PREFIX: &str = "x-outlet-meta-";
        let mut out = Self::default();
        for header in headers {
            let key = header.get_key_ref().to_ascii_lowercase();
            let value = header.get_value();
            match key.as_str() {
                "x-outlet-list" => {
                    let value = value.trim();
                    if !value.is_empty() {
                        out.list = Some(value.to_string());
                    }
                }
                "x-outlet-tags" => {
                    out.tags = value
                        .split(',')
                        .map(str::trim)
                        .filter(|tag| !tag.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "x-outlet-template" => {
                    let value = value.trim();
                    if !value.is_empty() {
                        out.template = Some(value.to_string());
                    }
                }
                "x-outlet-type" => match value.trim().to_ascii_lowercase().as_str() {
                    "marketing" => out.message_type = MessageType::Marketing,
                    "transactional" => out.message_type = MessageType::Transactional,
                    _ => {}
                },
                "x-outlet-track" => {
                    let value = value.trim().to_ascii_lowercase();
                    if value == "none" {
                        out.track_opens = false;
                        out.track_clicks = false;
                    } else if !value.is_empty() {
                        let wanted: Vec<&str> = value.split(',').map(str::trim).collect();
                        out.track_opens = wanted.contains(&"opens");
                        out.track_clicks = wanted.contains(&"clicks");
                    }
                }
                _ if key.starts_with(META_PREFIX) => {
                    // Preserve the caller's casing of the suffix.
                    let suffix = header.get_key_ref()[META_PREFIX.len()..].to_string();
                    if !suffix.is_empty() {
                        out.meta.insert(suffix, value.trim().to_string());
                    }
                }
                _ => {}
            }
        }
        out
    }
}

/// Walk the MIME tree collecting the html and plain alternatives.
fn extract_body(parsed: &ParsedMail) -> (String, String) {
    fn collect(part: &ParsedMail, html: &mut String, plain: &mut String) {
        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        if mimetype.starts_with("multipart/") {
            for sub in &part.subparts {
                collect(sub, html, plain);
            }
        } else if mimetype == "text/html" {
            if let Ok(body) = part.get_body() {
                *html = body;
            }
        } else if mimetype == "text/plain" {
            if let Ok(body) = part.get_body() {
                *plain = body;
            }
        }
    }
    let mut html = String::new();
    let mut plain = String::new();
    collect(parsed, &mut html, &mut plain);
    (html, plain)
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Ehlo(String),
    Helo(String),
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Mail(String),
    Rcpt(String),
    Data,
    Rset,
    Noop,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> anyhow::Result<Self> {
        fn prefix_match(line: &str, candidate: &str) -> bool {
            if line.len() < candidate.len() {
                false
            } else {
                line[..candidate.len()].eq_ignore_ascii_case(candidate)
            }
        }

        fn extract_envelope(line: &str) -> anyhow::Result<(&str, &str)> {
            if !line.starts_with('<') {
                anyhow::bail!("expected <: {line:?}");
            }
            let rangle = line
                .bytes()
                .position(|c| c == b'>')
                .ok_or_else(|| anyhow::anyhow!("expected >: {line:?}"))?;

            Ok((&line[1..rangle], &line[rangle + 1..]))
        }

        Ok(if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("NOOP") {
            Self::Noop
        } else if prefix_match(line, "EHLO ") {
            Self::Ehlo(line[5..].to_string())
        } else if prefix_match(line, "HELO ") {
            Self::Helo(line[5..].to_string())
        } else if prefix_match(line, "AUTH ") {
            let mut parts = line[5..].split_ascii_whitespace();
            let mechanism = parts
                .next()
                .ok_or_else(|| anyhow!("missing mechanism"))?
                .to_string();
            Self::Auth {
                mechanism,
                initial: parts.next().map(str::to_string),
            }
        } else if prefix_match(line, "MAIL FROM:") {
            let (address, _params) = extract_envelope(&line[10..])?;
            Self::Mail(address.to_string())
        } else if prefix_match(line, "RCPT TO:") {
            let (address, _params) = extract_envelope(&line[8..])?;
            if address.is_empty() {
                anyhow::bail!("Null sender not permitted as a recipient");
            }
            Self::Rcpt(address.to_string())
        } else {
            Self::Unknown(line.to_string())
        })
    }
}
