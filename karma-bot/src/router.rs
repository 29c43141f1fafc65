use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    protocol::{ChatMessage, Inbound},
    transport::{ConnectionState, Transport},
};

/// Chat messages buffered between the router and the dispatcher.
pub const QUEUE_DEPTH: usize = 64;

pub fn queue() -> (mpsc::Sender<ChatMessage>, mpsc::Receiver<ChatMessage>) {
    mpsc::channel(QUEUE_DEPTH)
}

/// Reads the connection until it ends, forwarding chat messages in arrival
/// order.
///
/// Returns `Ok(())` when the server closes the connection or the dispatcher
/// stops listening, and the network error when reading fails.
pub async fn run<R, W>(mut transport: Transport<R, W>, queue: mpsc::Sender<ChatMessage>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let writer = transport.writer();

    loop {
        let inbound = match transport.receive().await {
            Ok(Some(inbound)) => inbound,
            Ok(None) => {
                info!("server closed the connection");
                writer.set_state(ConnectionState::Terminating).await;
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "failed to read from server");
                writer.set_state(ConnectionState::Terminating).await;
                return Err(err);
            }
        };

        match inbound {
            // Already answered by the transport.
            Inbound::Probe { .. } | Inbound::Other => {}
            Inbound::Chat(message) => {
                if queue.send(message).await.is_err() {
                    debug!("dispatcher stopped, router exiting");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader, duplex};

    #[tokio::test]
    async fn forwards_only_chat_messages_in_order() {
        let (client, mut server) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let transport = Transport::new(BufReader::new(read_half), write_half);
        let (tx, mut rx) = queue();

        server
            .write_all(
                b":irc.example.net 001 karmabot :Welcome\r\n\
                  PING :irc.example.net\r\n\
                  :alice!a@host PRIVMSG #karma :bob++\r\n\
                  :alice PRIVMSG\r\n\
                  :bob!b@host PRIVMSG karmabot :hello\r\n",
            )
            .await
            .expect("write lines");
        // Close only our write direction so the PONG can still be delivered.
        server.shutdown().await.expect("shutdown server writes");

        run(transport, tx).await.expect("router finished cleanly");

        let first = rx.recv().await.expect("first message");
        assert_eq!(first.sender, "alice");
        assert_eq!(first.text, "bob++");

        let second = rx.recv().await.expect("second message");
        assert_eq!(second.sender, "bob");
        assert_eq!(second.target, "karmabot");

        assert!(rx.recv().await.is_none());
    }
}
