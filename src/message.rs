use std::{io, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Rendering applied to every timestamp the process emits. Clients may
/// parse the line prefix, so it stays fixed for the process lifetime.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Display name attached to hub-generated join and leave notices. Not a
/// participant: it is never registered and never owns a delivery queue.
pub const BOT_NAME: &str = "ChatBot";

pub(crate) type SessionId = u64;

/// One connected participant: the display name it registered under plus
/// the identity of the connection that registered it. Names are taken
/// verbatim from the client and may collide; the session id is what tells
/// two same-named registrations apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: Arc<str>,
    pub(crate) session: SessionId,
}

impl User {
    pub(crate) fn new(name: impl Into<Arc<str>>, session: SessionId) -> Self {
        Self {
            name: name.into(),
            session,
        }
    }
}

/// Who authored a message: a participant, or the synthetic identity
/// behind membership announcements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Author {
    User(Arc<str>),
    Bot,
}

impl Author {
    pub fn name(&self) -> &str {
        match self {
            Author::User(name) => name,
            Author::Bot => BOT_NAME,
        }
    }
}

/// An immutable chat event. Built once per inbound line (or synthesized
/// by the hub for announcements) and cloned into each recipient's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: Author,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(sender: Author, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// The protocol line for this message, without the trailing newline.
    pub fn render(&self) -> String {
        format!(
            "{} {}: {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.sender.name(),
            self.text
        )
    }
}

/// Reads one newline-terminated line, stripping the terminator. Returns
/// `None` at end of stream. Empty lines come back as empty strings; the
/// protocol relays them like any other line.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    line.truncate(line.trim_end_matches(LINE_ENDINGS).len());
    Ok(Some(line))
}

/// Writes `line` plus a newline delimiter and flushes so peers see it
/// without waiting for more output.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
