use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single line when the operator does not configure one.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// First line every connection receives; the reply is the display name.
pub const NAME_PROMPT: &str = "Введите ваше имя: ";

const LINE_ENDINGS: &[char] = &['\n', '\r'];
const CHAT_FULL_PREFIX: &str = "[Server] The chat is full";

pub fn join_notice(name: &str) -> String {
    format!("[Server] {name} joined the chat!")
}

pub fn leave_notice(name: &str) -> String {
    format!("[Server] {name} left the chat.")
}

pub fn welcome(name: &str, online: usize) -> String {
    format!("Welcome to the chat, {name}! Users online: {online}")
}

pub fn chat_line(name: &str, text: &str) -> String {
    format!("{name}: {text}")
}

pub fn chat_full(capacity: usize) -> String {
    format!("{CHAT_FULL_PREFIX} ({capacity} users). Try again later.")
}

/// Whether a line sent in place of the welcome is a capacity refusal.
pub fn is_chat_full(line: &str) -> bool {
    line.starts_with(CHAT_FULL_PREFIX)
}

/// Trims the submitted name, falling back to `User_<port>` when nothing is left.
pub fn resolve_name(submitted: &str, peer_port: u16) -> String {
    let trimmed = submitted.trim();
    if trimmed.is_empty() {
        format!("User_{peer_port}")
    } else {
        trimmed.to_string()
    }
}

/// Reads one newline-delimited line, without its line ending.
///
/// Returns `Ok(None)` once the peer has closed the stream. A final line that
/// ends at EOF without a newline is still returned. Lines longer than
/// `max_bytes` and lines that are not valid UTF-8 fail with
/// [`io::ErrorKind::InvalidData`].
pub async fn read_line<R>(reader: &mut R, max_bytes: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    // One extra byte leaves room for the delimiter of a line that is exactly `max_bytes` long.
    let limit = max_bytes.saturating_add(1) as u64;
    let bytes = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut buffer)
        .await?;
    if bytes == 0 {
        return Ok(None);
    }

    if !buffer.ends_with(b"\n") && buffer.len() > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {max_bytes} bytes"),
        ));
    }

    let line = String::from_utf8(buffer)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
