use data_encoding::BASE64;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for the server")]
    TimedOut,
    #[error("malformed response line {0:?}")]
    MalformedResponse(String),
    #[error("connection closed by peer")]
    Disconnected,
    #[error("{command} rejected: {response}")]
    Rejected {
        command: &'static str,
        response: Response,
    },
}

/// An SMTP reply: the 3-digit code plus the (possibly multi-line)
/// text that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub message: String,
}

impl Response {
    /// 4xx: the server may accept this later; worth retrying.
    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// 5xx: the server will never accept this as-is.
    pub fn is_permanent(&self) -> bool {
        self.code >= 500
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{} {}", self.code, self.message)
    }
}

/// Timeouts applied to the individual protocol phases.
#[derive(Debug, Clone)]
pub struct SmtpClientTimeouts {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Applied to the DATA payload write and its final response;
    /// large messages on slow links need more headroom than a
    /// single command round trip.
    pub data_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            data_timeout: Duration::from_secs(300),
        }
    }
}

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadAndWrite for T {}

/// A live SMTP session. One in-flight command at a time; the caller
/// sequences MAIL/RCPT/DATA itself or uses [`SmtpClient::send_mail`].
pub struct SmtpClient {
    reader: BufReader<ReadHalf<Box<dyn AsyncReadAndWrite>>>,
    writer: BufWriter<WriteHalf<Box<dyn AsyncReadAndWrite>>>,
    timeouts: SmtpClientTimeouts,
}

impl std::fmt::Debug for SmtpClient {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("SmtpClient").finish()
    }
}

impl SmtpClient {
    /// Connect to `addr` and consume the 220 greeting.
    pub async fn connect(addr: &str, timeouts: SmtpClientTimeouts) -> Result<Self, ClientError> {
        let stream = timeout(timeouts.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::TimedOut)??;
        let mut client = Self::with_stream(stream, timeouts);
        let greeting = client.read_response(client.timeouts.command_timeout).await?;
        if greeting.code != 220 {
            return Err(ClientError::Rejected {
                command: "greeting",
                response: greeting,
            });
        }
        Ok(client)
    }

    /// Wrap an already-established stream. The caller is responsible
    /// for the greeting; used by tests driving an in-memory pipe.
    pub fn with_stream<S: AsyncReadAndWrite + 'static>(
        stream: S,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        let (reader, writer) = tokio::io::split(Box::new(stream) as Box<dyn AsyncReadAndWrite>);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            timeouts,
        }
    }

    pub async fn read_response(&mut self, deadline: Duration) -> Result<Response, ClientError> {
        let mut message = String::new();
        loop {
            let mut line = String::new();
            let n = timeout(deadline, self.reader.read_line(&mut line))
                .await
                .map_err(|_| ClientError::TimedOut)??;
            if n == 0 {
                return Err(ClientError::Disconnected);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 3 {
                return Err(ClientError::MalformedResponse(line.to_string()));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| ClientError::MalformedResponse(line.to_string()))?;
            let (text, done) = match line.as_bytes().get(3) {
                Some(b'-') => (&line[4..], false),
                Some(_) => (&line[4.min(line.len())..], true),
                None => ("", true),
            };
            if !message.is_empty() {
                message.push('\n');
            }
            message.push_str(text);
            if done {
                return Ok(Response { code, message });
            }
        }
    }

    async fn command(&mut self, line: &str) -> Result<Response, ClientError> {
        tracing::trace!("-> {line}");
        let deadline = self.timeouts.command_timeout;
        timeout(deadline, async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\r\n").await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| ClientError::TimedOut)??;
        let response = self.read_response(deadline).await?;
        tracing::trace!("<- {response}");
        Ok(response)
    }

    fn accept(
        command: &'static str,
        response: Response,
        ok: &[u16],
    ) -> Result<Response, ClientError> {
        if ok.contains(&response.code) {
            Ok(response)
        } else {
            Err(ClientError::Rejected { command, response })
        }
    }

    pub async fn ehlo(&mut self, domain: &str) -> Result<Response, ClientError> {
        let response = self.command(&format!("EHLO {domain}")).await?;
        Self::accept("EHLO", response, &[250])
    }

    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), ClientError> {
        let credential = BASE64.encode(format!("\x00{username}\x00{password}").as_bytes());
        let response = self.command(&format!("AUTH PLAIN {credential}")).await?;
        Self::accept("AUTH PLAIN", response, &[235])?;
        Ok(())
    }

    pub async fn mail_from(&mut self, address: &str) -> Result<(), ClientError> {
        let response = self.command(&format!("MAIL FROM:<{address}>")).await?;
        Self::accept("MAIL FROM", response, &[250])?;
        Ok(())
    }

    pub async fn rcpt_to(&mut self, address: &str) -> Result<(), ClientError> {
        let response = self.command(&format!("RCPT TO:<{address}>")).await?;
        Self::accept("RCPT TO", response, &[250, 251])?;
        Ok(())
    }

    /// Run the DATA phase: announce, send the dot-stuffed payload,
    /// and terminate with CRLF.CRLF.
    pub async fn data(&mut self, payload: &[u8]) -> Result<Response, ClientError> {
        let response = self.command("DATA").await?;
        Self::accept("DATA", response, &[354])?;

        let stuffed = dot_stuff(payload);
        timeout(self.timeouts.data_timeout, async {
            self.writer.write_all(&stuffed).await?;
            if !stuffed.ends_with(b"\r\n") {
                self.writer.write_all(b"\r\n").await?;
            }
            self.writer.write_all(b".\r\n").await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| ClientError::TimedOut)??;

        let response = self.read_response(self.timeouts.data_timeout).await?;
        Self::accept("message body", response, &[250])
    }

    /// Abort any transaction in progress so the session can be
    /// reused for another message.
    pub async fn rset(&mut self) -> Result<(), ClientError> {
        let response = self.command("RSET").await?;
        Self::accept("RSET", response, &[250])?;
        Ok(())
    }

    /// Liveness probe.
    pub async fn noop(&mut self) -> Result<(), ClientError> {
        let response = self.command("NOOP").await?;
        Self::accept("NOOP", response, &[250])?;
        Ok(())
    }

    pub async fn quit(&mut self) -> Result<(), ClientError> {
        let response = self.command("QUIT").await?;
        Self::accept("QUIT", response, &[221])?;
        Ok(())
    }

    /// Complete envelope for one message on this session.
    pub async fn send_mail(
        &mut self,
        from: &str,
        to: &[String],
        payload: &[u8],
    ) -> Result<Response, ClientError> {
        self.mail_from(from).await?;
        for recipient in to {
            self.rcpt_to(recipient).await?;
        }
        self.data(payload).await
    }
}

/// Double any leading dot so the payload cannot terminate DATA early.
fn dot_stuff(payload: &[u8]) -> Vec<u8> {
    let mut stuffed = Vec::with_capacity(payload.len());
    let mut at_line_start = true;
    for &byte in payload {
        if at_line_start && byte == b'.' {
            stuffed.push(b'.');
        }
        stuffed.push(byte);
        at_line_start = byte == b'\n';
    }
    stuffed
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn dot_stuffing() {
        assert_equal!(dot_stuff(b"hello\r\nworld\r\n"), b"hello\r\nworld\r\n");
        assert_equal!(dot_stuff(b".hello\r\n"), b"..hello\r\n");
        assert_equal!(dot_stuff(b"a\r\n.\r\nb\r\n"), b"a\r\n..\r\nb\r\n");
    }

    #[test]
    fn response_classification() {
        let transient = Response {
            code: 451,
            message: "try again later".to_string(),
        };
        assert!(transient.is_transient());
        assert!(!transient.is_permanent());

        let permanent = Response {
            code: 550,
            message: "no such user".to_string(),
        };
        assert!(permanent.is_permanent());
        assert!(!permanent.is_transient());
    }

    #[tokio::test]
    async fn multi_line_responses_are_collected() {
        let (client_side, mut server_side) = tokio::io::duplex(1024);
        let mut client = SmtpClient::with_stream(client_side, SmtpClientTimeouts::default());

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 256];
            server_side.read(&mut buf).await.unwrap();
            server_side
                .write_all(b"250-mail.example.com\r\n250-PIPELINING\r\n250 AUTH PLAIN\r\n")
                .await
                .unwrap();
        });

        let response = client.ehlo("sender.example.com").await.unwrap();
        assert_equal!(response.code, 250);
        assert_equal!(
            response.message,
            "mail.example.com\nPIPELINING\nAUTH PLAIN"
        );
    }

    #[tokio::test]
    async fn rejection_carries_the_response() {
        let (client_side, mut server_side) = tokio::io::duplex(1024);
        let mut client = SmtpClient::with_stream(client_side, SmtpClientTimeouts::default());

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 256];
            server_side.read(&mut buf).await.unwrap();
            server_side
                .write_all(b"550 5.1.1 no such user\r\n")
                .await
                .unwrap();
        });

        match client.rcpt_to("ghost@example.com").await {
            Err(ClientError::Rejected { command, response }) => {
                assert_equal!(command, "RCPT TO");
                assert!(response.is_permanent());
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
