use std::io;

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tracing::{debug, info};

use crate::{
    hub::HubHandle,
    message::{self, Author, Message, User},
};

/// Sent verbatim before the username line is read. No trailing newline;
/// the reply is still expected as one line.
pub const USERNAME_PROMPT: &str = "Enter your username: ";

/// Speaks the protocol on one accepted connection: prompt, verbatim
/// username, join, then relay lines in and deliveries out until the peer
/// hangs up or the hub closes the delivery queue. The hub hears about
/// the departure no matter which direction ended the session.
pub async fn run(stream: TcpStream, hub: HubHandle) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let Some((user, deliveries)) = register(&mut reader, &mut writer, &hub).await? else {
        debug!(?peer, "connection closed before a username arrived");
        return Ok(());
    };

    info!(?peer, user = %user.name, "session started");
    let relayed = relay(&mut reader, &mut writer, &hub, &user, deliveries).await;
    hub.leave(user.clone()).await;
    info!(?peer, user = %user.name, "session ended");

    relayed?;
    Ok(())
}

async fn register<R, W>(
    reader: &mut R,
    writer: &mut W,
    hub: &HubHandle,
) -> io::Result<Option<(User, mpsc::Receiver<Message>)>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(USERNAME_PROMPT.as_bytes()).await?;
    writer.flush().await?;

    // The first line is the name, verbatim: no trimming beyond the line
    // terminator and no uniqueness check here.
    let Some(name) = message::read_line(reader).await? else {
        return Ok(None);
    };

    let user = hub.new_user(name);
    let (outbound, deliveries) = hub.outbound_channel();
    hub.join(user.clone(), outbound).await;
    Ok(Some((user, deliveries)))
}

/// Runs the inbound and outbound halves concurrently and settles when
/// either one does.
async fn relay<R, W>(
    reader: &mut R,
    writer: &mut W,
    hub: &HubHandle,
    user: &User,
    mut deliveries: mpsc::Receiver<Message>,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    select! {
        inbound = forward_inbound(reader, hub, user) => inbound,
        outbound = deliver_outbound(writer, &mut deliveries) => outbound,
    }
}

/// Reader half: every inbound line becomes a broadcast request. A read
/// error ends the loop the same way a clean close does.
async fn forward_inbound<R>(reader: &mut R, hub: &HubHandle, user: &User) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = message::read_line(reader).await? {
        hub.broadcast(Message::new(Author::User(user.name.clone()), line))
            .await;
    }
    Ok(())
}

/// Writer half: drains the delivery queue onto the connection. Ends when
/// the hub closes the queue (displacement, or the disconnect overflow
/// policy) or a write fails.
async fn deliver_outbound<W>(
    writer: &mut W,
    deliveries: &mut mpsc::Receiver<Message>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(delivery) = deliveries.recv().await {
        message::write_line(writer, &delivery.render()).await?;
    }
    Ok(())
}
