//! Session lifecycle: join, serve chat until told to stop, shut down cleanly.

use std::{future::Future, io, sync::Arc};

use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    select,
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    VERSION,
    config::SessionConfig,
    dispatch::Dispatcher,
    error::{Error, Result},
    router,
    store::KarmaStore,
    transport::Transport,
};

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The shutdown future completed.
    Shutdown,
    /// The server closed the connection.
    Disconnected,
}

/// Runs a registered session until `shutdown` completes or the connection
/// ends.
///
/// Whatever the outcome, the server is sent a QUIT notice and the store is
/// flushed and closed before returning. A persist failure or a read error is
/// returned as the session's error.
pub async fn run<R, W, F>(
    transport: Transport<R, W>,
    config: Arc<SessionConfig>,
    store: Arc<KarmaStore>,
    shutdown: F,
) -> Result<SessionEnd>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()> + Send,
{
    let writer = transport.writer();
    let outcome = serve(transport, &config, &store, shutdown).await;

    writer.quit(&config.quit_message).await;

    match (outcome, store.close_async().await) {
        (Ok(end), Ok(())) => {
            info!(?end, "session finished");
            Ok(end)
        }
        (Ok(_), Err(err)) => {
            error!(error = %err, "failed to flush karma store on shutdown");
            Err(err)
        }
        (Err(err), closed) => {
            if let Err(close_err) = closed {
                warn!(error = %close_err, "failed to flush karma store after fatal error");
            }
            Err(err)
        }
    }
}

async fn serve<R, W, F>(
    mut transport: Transport<R, W>,
    config: &Arc<SessionConfig>,
    store: &Arc<KarmaStore>,
    shutdown: F,
) -> Result<SessionEnd>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()> + Send,
{
    transport.join(&config.channel).await?;

    let writer = transport.writer();
    let banner = format!("{} version {VERSION} reporting for duty.", config.nickname);
    if let Err(error) = writer.privmsg(&config.channel, &banner).await {
        warn!(%error, "failed to announce arrival");
    }

    let (queue, mut inbox) = router::queue();
    let mut router = tokio::spawn(router::run(transport, queue));
    let dispatcher = Dispatcher::new(Arc::clone(config), Arc::clone(store), writer);
    tokio::pin!(shutdown);

    // A command always runs to completion, so a mutation is never cut off
    // from its persist. Delivering the replies can stall on a server that
    // stops reading, and that part gives way to shutdown.
    let outcome = loop {
        select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested");
                break Ok(SessionEnd::Shutdown);
            }
            message = inbox.recv() => match message {
                Some(message) => {
                    let replies = match dispatcher.respond(&message).await {
                        Ok(replies) => replies,
                        Err(err) => {
                            error!(error = %err, "fatal error while handling chat");
                            break Err(err);
                        }
                    };
                    select! {
                        biased;
                        _ = &mut shutdown => {
                            warn!("shutdown requested while replies were pending");
                            break Ok(SessionEnd::Shutdown);
                        }
                        _ = dispatcher.deliver(&message, replies) => {}
                    }
                }
                None => break router_outcome(&mut router).await,
            }
        }
    };

    router.abort();
    outcome
}

async fn router_outcome(router: &mut JoinHandle<Result<()>>) -> Result<SessionEnd> {
    match router.await {
        Ok(Ok(())) => Ok(SessionEnd::Disconnected),
        Ok(Err(err)) => Err(err),
        Err(join_err) => Err(Error::Network(io::Error::new(io::ErrorKind::Other, join_err))),
    }
}
