use std::{io, mem::take, net::IpAddr, sync::Arc};

use base64::{engine::general_purpose, Engine as _};
use mailsink_utils::{
    AuthEngine, AuthError, AuthResult, Delivery, HandlerError, MessageHandler, SenderPolicy,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

/// Settings and collaborators shared by every session of a server.
pub struct SessionContext {
    /// Name used in the greeting and the `EHLO` reply.
    pub hostname: String,
    pub policy: SenderPolicy,
    pub auth: Arc<dyn AuthEngine>,
    pub handler: Arc<dyn MessageHandler>,
    /// Largest accepted message in bytes, unlimited when `None`.
    pub max_message_size: Option<usize>,
    pub advertise_auth: bool,
}

/// Whether the connection should keep going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Represents a single SMTP session, created for each incoming connection.
///
/// Holds the greeting state plus the envelope of the transaction in
/// progress. Several transactions may run over the same connection, each
/// one is cleared once its `DATA` phase completes or on `RSET`.
pub struct SmtpSession {
    context: Arc<SessionContext>,
    client_ip: Option<IpAddr>,
    helo_domain: Option<String>,
    authenticated: Option<String>,
    from: Option<String>,
    rcpts: Vec<String>,
}

impl SmtpSession {
    pub fn new(context: Arc<SessionContext>, client_ip: Option<IpAddr>) -> Self {
        Self {
            context,
            client_ip,
            helo_domain: None,
            authenticated: None,
            from: None,
            rcpts: Vec::new(),
        }
    }

    /// Drives the session until the client quits or disconnects.
    pub async fn run<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> io::Result<()> {
        let greeting = format!("{} Mailsink ESMTP ready", self.context.hostname);
        self.write_response(writer, 220, &greeting).await?;

        loop {
            let line = match read_line(reader).await? {
                Some(Input::Line(line)) => line,
                Some(Input::TooLong) => {
                    self.write_response(writer, 500, "Line too long").await?;
                    continue;
                }
                None => {
                    debug!(client = ?self.client_ip, "Client disconnected");
                    return Ok(());
                }
            };
            trace!("<< {}", line);

            let (command, arg) = split_command(&line);
            if self.handle_command(reader, writer, &command, arg).await? == Flow::Quit {
                return Ok(());
            }
        }
    }

    /// Base handler for the SMTP commands, concentrating all the command
    /// dispatch in a single place.
    pub async fn handle_command<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        command: &str,
        arg: &str,
    ) -> io::Result<Flow> {
        match command {
            "EHLO" => self.handle_helo(writer, arg, true).await?,
            "HELO" => self.handle_helo(writer, arg, false).await?,
            "AUTH" => self.handle_auth(reader, writer, arg).await?,
            "MAIL" => self.handle_mail(writer, arg).await?,
            "RCPT" => self.handle_rcpt(writer, arg).await?,
            "DATA" => self.handle_data(reader, writer).await?,
            "RSET" => {
                self.reset_transaction();
                self.write_response(writer, 250, "Flushed").await?;
            }
            "NOOP" => self.write_response(writer, 250, "OK").await?,
            "VRFY" => {
                self.write_response(
                    writer,
                    252,
                    "Cannot VRFY user, but will accept message and attempt delivery",
                )
                .await?
            }
            "QUIT" => {
                self.write_response(writer, 221, "Bye").await?;
                return Ok(Flow::Quit);
            }
            "" => {
                self.write_response(writer, 500, "Syntax error, command unrecognized")
                    .await?
            }
            _ => self.write_response(writer, 502, "Command not implemented").await?,
        }
        Ok(Flow::Continue)
    }

    async fn handle_helo<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        domain: &str,
        extended: bool,
    ) -> io::Result<()> {
        if domain.is_empty() {
            let usage = if extended {
                "Syntax: EHLO hostname"
            } else {
                "Syntax: HELO hostname"
            };
            return self.write_response(writer, 501, usage).await;
        }

        self.helo_domain = Some(domain.to_string());
        self.reset_transaction();

        let greeting = format!("{} Nice to meet you, {}", self.context.hostname, domain);
        if !extended {
            return self.write_response(writer, 250, &greeting).await;
        }

        let mut lines = vec![greeting, "8BITMIME".to_string()];
        if let Some(size) = self.context.max_message_size {
            lines.push(format!("SIZE {size}"));
        }
        if self.context.advertise_auth {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        self.write_multiple(writer, 250, &lines).await
    }

    async fn handle_auth<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        arg: &str,
    ) -> io::Result<()> {
        if self.helo_domain.is_none() {
            return self
                .write_response(writer, 503, "Error: send HELO/EHLO first")
                .await;
        }
        if self.authenticated.is_some() {
            return self.write_response(writer, 503, "Already authenticated").await;
        }

        let (mechanism, initial) = split_command(arg);
        let initial = (!initial.is_empty()).then_some(initial);

        let credentials = match mechanism.as_str() {
            "PLAIN" => {
                let response = match initial {
                    Some(value) => value.to_string(),
                    None => match self.challenge(reader, writer, "").await? {
                        Some(value) => value,
                        None => return Ok(()),
                    },
                };
                decode_plain(&response)
            }
            "LOGIN" => {
                let username = match initial {
                    Some(value) => value.to_string(),
                    None => match self.challenge(reader, writer, "VXNlcm5hbWU6").await? {
                        Some(value) => value,
                        None => return Ok(()),
                    },
                };
                let Some(password) = self.challenge(reader, writer, "UGFzc3dvcmQ6").await? else {
                    return Ok(());
                };
                decode_base64(&username)
                    .and_then(|username| Ok((username, decode_base64(&password)?)))
            }
            _ => {
                return self
                    .write_response(writer, 504, "Unrecognized authentication type")
                    .await;
            }
        };

        let (username, password) = match credentials {
            Ok(credentials) => credentials,
            Err(error) => return self.write_response(writer, 501, &error.to_string()).await,
        };

        match self.context.auth.authenticate(&username, &password) {
            Ok(true) => {
                debug!(username = %username, "SMTP client authenticated");
                self.authenticated = Some(username);
                self.write_response(writer, 235, "Authentication successful").await
            }
            Ok(false) => {
                info!(username = %username, "SMTP authentication refused");
                self.write_response(writer, 535, "Authentication failed").await
            }
            Err(error) => {
                warn!(error = %error, "SMTP authentication engine failed");
                self.write_response(writer, 454, "Temporary authentication failure")
                    .await
            }
        }
    }

    /// Sends a `334` continuation and reads the client answer, `None` when
    /// the exchange was cancelled with `*` or the answer was too long.
    async fn challenge<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &self,
        reader: &mut R,
        writer: &mut W,
        prompt: &str,
    ) -> io::Result<Option<String>> {
        self.write_response(writer, 334, prompt).await?;
        let line = match read_line(reader).await? {
            Some(Input::Line(line)) => line,
            Some(Input::TooLong) => {
                self.write_response(writer, 500, "Line too long").await?;
                return Ok(None);
            }
            None => return Err(io::ErrorKind::UnexpectedEof.into()),
        };
        if line.trim() == "*" {
            self.write_response(writer, 501, "Authentication aborted").await?;
            return Ok(None);
        }
        Ok(Some(line))
    }

    async fn handle_mail<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        arg: &str,
    ) -> io::Result<()> {
        if self.helo_domain.is_none() {
            return self
                .write_response(writer, 503, "Error: send HELO/EHLO first")
                .await;
        }
        if self.from.is_some() {
            return self.write_response(writer, 503, "Error: nested MAIL command").await;
        }

        let Some((address, params)) = parse_path(arg, "FROM:") else {
            return self
                .write_response(writer, 501, "Syntax error in parameters or arguments")
                .await;
        };

        if let Err(error) = self.context.policy.admit_sender(&address) {
            info!(from = %address, client = ?self.client_ip, "Refused sender outside whitelist");
            return self.write_response(writer, 550, &error.to_string()).await;
        }

        let declared = declared_size(params);
        if let (Some(limit), Some(declared)) = (self.context.max_message_size, declared) {
            if declared > limit {
                return self
                    .write_response(
                        writer,
                        552,
                        "Message size exceeds fixed maximum message size",
                    )
                    .await;
            }
        }

        self.from = Some(address);
        self.write_response(writer, 250, "Accepted").await
    }

    async fn handle_rcpt<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        arg: &str,
    ) -> io::Result<()> {
        if self.from.is_none() {
            return self.write_response(writer, 503, "Error: need MAIL command").await;
        }

        match parse_path(arg, "TO:") {
            Some((address, _)) if !address.is_empty() => {
                self.rcpts.push(address);
                self.write_response(writer, 250, "Accepted").await
            }
            _ => {
                self.write_response(writer, 501, "Syntax error in parameters or arguments")
                    .await
            }
        }
    }

    async fn handle_data<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> io::Result<()> {
        if self.from.is_none() {
            return self.write_response(writer, 503, "Error: need MAIL command").await;
        }
        if self.rcpts.is_empty() {
            return self.write_response(writer, 554, "No valid recipients").await;
        }

        self.write_response(writer, 354, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let (raw, oversized) = read_data(reader, self.context.max_message_size).await?;
        let from = self.from.take().unwrap_or_default();
        let rcpts = take(&mut self.rcpts);

        if oversized {
            info!(from = %from, "Discarded message over the size limit");
            return self
                .write_response(writer, 552, "Message size exceeds fixed maximum message size")
                .await;
        }

        let mut delivery = Delivery::new(from, rcpts, raw);
        delivery.client_ip = self.client_ip;
        delivery.helo_domain = self.helo_domain.clone();

        match self.context.handler.handle(delivery).await {
            Ok(message_id) => {
                let reply = format!("OK: message queued as {message_id}");
                self.write_response(writer, 250, &reply).await
            }
            Err(HandlerError::Parse(error)) => {
                let reply = format!("Transaction failed: {error}");
                self.write_response(writer, 554, &reply).await
            }
            Err(error) => {
                warn!(
                    handler = self.context.handler.name(),
                    error = %error,
                    "Message handler failed"
                );
                self.write_response(
                    writer,
                    451,
                    "Requested action aborted: local error in processing",
                )
                .await
            }
        }
    }

    fn reset_transaction(&mut self) {
        self.from = None;
        self.rcpts.clear();
    }

    async fn write_inner<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
        separator: &str,
    ) -> io::Result<()> {
        trace!(">> {}{}{}", code, separator, message);
        writer
            .write_all(format!("{code}{separator}{message}\r\n").as_bytes())
            .await
    }

    async fn write_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
    ) -> io::Result<()> {
        self.write_inner(writer, code, message, " ").await?;
        writer.flush().await
    }

    async fn write_multiple<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        messages: &[String],
    ) -> io::Result<()> {
        for (index, message) in messages.iter().enumerate() {
            let is_last = index == messages.len() - 1;
            let separator = if is_last { " " } else { "-" };
            self.write_inner(writer, code, message, separator).await?;
        }
        writer.flush().await
    }
}

/// Longest accepted command line, terminator included.
const MAX_COMMAND_LINE: usize = 1000;

/// A command line sent by the client.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Line(String),
    TooLong,
}

/// Reads a command line without its terminator, `None` on end of stream.
///
/// Bytes past [`MAX_COMMAND_LINE`] are consumed but never buffered.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Input>> {
    let mut buffer = Vec::with_capacity(MAX_COMMAND_LINE);
    let (read, truncated) = read_bounded(reader, &mut buffer, MAX_COMMAND_LINE).await?;
    if read == 0 {
        return Ok(None);
    }
    if truncated {
        return Ok(Some(Input::TooLong));
    }
    let line = String::from_utf8_lossy(&buffer);
    Ok(Some(Input::Line(line.trim_end_matches(['\r', '\n']).to_string())))
}

/// Consumes input up to and including the next `\n`, keeping at most `max`
/// bytes of it in `buffer`.
///
/// Returns the number of bytes consumed and whether some were dropped.
async fn read_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
    max: usize,
) -> io::Result<(usize, bool)> {
    let mut read = 0;
    let mut truncated = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok((read, truncated));
        }
        let (length, complete) = match available.iter().position(|&byte| byte == b'\n') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };

        let room = max.saturating_sub(buffer.len());
        if length > room {
            truncated = true;
        }
        buffer.extend_from_slice(&available[..length.min(room)]);
        reader.consume(length);
        read += length;

        if complete {
            return Ok((read, truncated));
        }
    }
}

/// Reads the `DATA` payload up to the lone dot line, undoing dot-stuffing.
///
/// Past `limit` the remaining input is still consumed so that the session
/// stays in sync, but nothing more is buffered. The returned flag tells
/// whether that happened.
async fn read_data<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: Option<usize>,
) -> io::Result<(Vec<u8>, bool)> {
    let mut data = Vec::new();
    let mut line = Vec::with_capacity(1024);
    let mut oversized = false;

    loop {
        // room for the remaining budget, a stuffed dot and the terminator
        let max = match limit {
            _ if oversized => 3,
            Some(limit) => limit.saturating_sub(data.len()).saturating_add(3),
            None => usize::MAX,
        };

        line.clear();
        let (read, truncated) = read_bounded(reader, &mut line, max).await?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if !truncated && (line == b".\r\n" || line == b".\n") {
            break;
        }
        if oversized {
            continue;
        }

        let content = line.strip_prefix(b".").unwrap_or(&line[..]);
        if truncated || limit.is_some_and(|limit| data.len() + content.len() > limit) {
            oversized = true;
            data = Vec::new();
            continue;
        }
        data.extend_from_slice(content);
    }

    Ok((data, oversized))
}

/// Splits a line into its upper-cased verb and the trimmed remainder.
fn split_command(line: &str) -> (String, &str) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

/// Parses `FROM:<path> params` or `TO:<path> params`, the prefix matched
/// case-insensitively. Returns the bare address and the parameter string.
fn parse_path<'a>(arg: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    let head = arg.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = arg[prefix.len()..].trim_start();

    if let Some(inner) = rest.strip_prefix('<') {
        let end = inner.find('>')?;
        Some((inner[..end].trim().to_string(), inner[end + 1..].trim()))
    } else {
        let (address, params) = rest.split_once(' ').unwrap_or((rest, ""));
        Some((address.to_string(), params.trim()))
    }
}

/// Extracts the `SIZE=` value announced in `MAIL FROM` parameters.
fn declared_size(params: &str) -> Option<usize> {
    params.split_whitespace().find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.eq_ignore_ascii_case("SIZE").then(|| value.parse().ok())?
    })
}

fn decode_base64(value: &str) -> AuthResult<String> {
    let bytes = general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|_| AuthError::Malformed)?;
    String::from_utf8(bytes).map_err(|_| AuthError::Malformed)
}

/// Decodes an `AUTH PLAIN` response, `authzid NUL authcid NUL passwd`.
fn decode_plain(value: &str) -> AuthResult<(String, String)> {
    let decoded = decode_base64(value)?;
    let mut parts = decoded.split('\0');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(username), Some(password), None) => {
            Ok((username.to_string(), password.to_string()))
        }
        _ => Err(AuthError::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::BufReader;

    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("ehlo client.test"), ("EHLO".to_string(), "client.test"));
        assert_eq!(split_command("QUIT"), ("QUIT".to_string(), ""));
        assert_eq!(split_command("  "), (String::new(), ""));
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("FROM:<a@example.com>", "FROM:"),
            Some(("a@example.com".to_string(), ""))
        );
        assert_eq!(
            parse_path("from: <a@example.com> BODY=8BITMIME SIZE=10", "FROM:"),
            Some(("a@example.com".to_string(), "BODY=8BITMIME SIZE=10"))
        );
        assert_eq!(
            parse_path("TO:b@example.com", "TO:"),
            Some(("b@example.com".to_string(), ""))
        );
        assert_eq!(parse_path("FROM:<>", "FROM:"), Some((String::new(), "")));
        assert_eq!(parse_path("FROM:<a@example.com", "FROM:"), None);
        assert_eq!(parse_path("TO:<b@example.com>", "FROM:"), None);
        assert_eq!(parse_path("", "FROM:"), None);
    }

    #[test]
    fn test_declared_size() {
        assert_eq!(declared_size("BODY=8BITMIME SIZE=2048"), Some(2048));
        assert_eq!(declared_size("size=12"), Some(12));
        assert_eq!(declared_size("SIZE=abc"), None);
        assert_eq!(declared_size(""), None);
    }

    #[test]
    fn test_decode_plain() {
        // "\0user\0pass"
        assert_eq!(
            decode_plain("AHVzZXIAcGFzcw==").unwrap(),
            ("user".to_string(), "pass".to_string())
        );
        assert_eq!(decode_plain("not base64!"), Err(AuthError::Malformed));
        // "user"
        assert_eq!(decode_plain("dXNlcg=="), Err(AuthError::Malformed));
    }

    #[tokio::test]
    async fn test_read_data_unstuffs_dots() {
        let input = b"Subject: x\r\n\r\n..leading dot\r\n.\r\nNOOP\r\n".to_vec();
        let mut reader = BufReader::new(&input[..]);

        let (data, oversized) = read_data(&mut reader, None).await.unwrap();

        assert!(!oversized);
        assert_eq!(data, b"Subject: x\r\n\r\n.leading dot\r\n");
        assert_eq!(
            read_line(&mut reader).await.unwrap(),
            Some(Input::Line("NOOP".to_string()))
        );
    }

    #[tokio::test]
    async fn test_read_data_drains_oversized_body() {
        let input = b"0123456789\r\n0123456789\r\n.\r\nQUIT\r\n".to_vec();
        let mut reader = BufReader::new(&input[..]);

        let (data, oversized) = read_data(&mut reader, Some(15)).await.unwrap();

        assert!(oversized);
        assert!(data.is_empty());
        assert_eq!(
            read_line(&mut reader).await.unwrap(),
            Some(Input::Line("QUIT".to_string()))
        );
    }

    #[tokio::test]
    async fn test_read_data_bounds_single_long_line() {
        let mut input = vec![b'a'; 4 * 1024 * 1024];
        input.extend_from_slice(b"\r\n.\r\nQUIT\r\n");
        let mut reader = BufReader::with_capacity(64, &input[..]);

        let mut line = Vec::new();
        let (read, truncated) = read_bounded(&mut reader, &mut line, 67).await.unwrap();
        assert_eq!(read, 4 * 1024 * 1024 + 2);
        assert!(truncated);
        assert_eq!(line.len(), 67);

        let mut reader = BufReader::with_capacity(64, &input[..]);
        let (data, oversized) = read_data(&mut reader, Some(64)).await.unwrap();

        assert!(oversized);
        assert!(data.is_empty());
        assert_eq!(
            read_line(&mut reader).await.unwrap(),
            Some(Input::Line("QUIT".to_string()))
        );
    }

    #[tokio::test]
    async fn test_read_data_keeps_body_at_limit() {
        let input = b"..12345678\r\n.\r\n".to_vec();
        let mut reader = BufReader::new(&input[..]);

        let (data, oversized) = read_data(&mut reader, Some(11)).await.unwrap();

        assert!(!oversized);
        assert_eq!(data, b".12345678\r\n");
    }

    #[tokio::test]
    async fn test_read_line_rejects_long_command() {
        let mut input = b"NOOP ".to_vec();
        input.extend(std::iter::repeat(b'x').take(100_000));
        input.extend_from_slice(b"\r\nQUIT\r\n");
        let mut reader = BufReader::new(&input[..]);

        assert_eq!(read_line(&mut reader).await.unwrap(), Some(Input::TooLong));
        assert_eq!(
            read_line(&mut reader).await.unwrap(),
            Some(Input::Line("QUIT".to_string()))
        );
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_data_eof_is_error() {
        let input = b"Subject: x\r\n".to_vec();
        let mut reader = BufReader::new(&input[..]);

        let error = read_data(&mut reader, None).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }
}
