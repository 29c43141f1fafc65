use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    error::{Error, Result},
    protocol::{Inbound, Outbound},
};

/// Upper bound on how long a QUIT notice may take before the connection is
/// abandoned.
pub const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest inbound line accepted, terminator included. Anything longer is
/// discarded up to the next newline.
pub const MAX_LINE_LEN: usize = 512;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Joined,
    Terminating,
}

pub type TcpTransport = Transport<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

/// Opens a TCP connection to the configured server and registers the bot.
pub async fn connect(config: &SessionConfig) -> Result<TcpTransport> {
    let stream = TcpStream::connect((config.server.as_str(), config.port))
        .await
        .map_err(Error::Network)?;

    info!(server = %config.server, port = config.port, "connected");

    let (reader, writer) = stream.into_split();
    let mut transport = Transport::new(BufReader::new(reader), writer);
    transport.register(config).await?;
    Ok(transport)
}

/// Read side of the session plus a handle on the shared write side.
///
/// Reading happens in one place only, so the read half is owned. The write
/// half is shared through [`SessionWriter`] because replies, keep-alive
/// answers and the final QUIT come from different tasks.
pub struct Transport<R, W> {
    reader: R,
    writer: SessionWriter<W>,
    buffer: Vec<u8>,
}

impl<R, W> Transport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer: SessionWriter::new(writer),
            buffer: Vec::new(),
        }
    }

    pub fn writer(&self) -> SessionWriter<W> {
        self.writer.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        self.writer.state().await
    }

    /// Identifies with the username and claims the nickname.
    pub async fn register(&mut self, config: &SessionConfig) -> Result<()> {
        self.writer
            .send(&Outbound::User {
                username: config.username.clone(),
            })
            .await?;
        self.writer
            .send(&Outbound::Nick {
                nickname: config.nickname.clone(),
            })
            .await?;
        self.writer.set_state(ConnectionState::Connected).await;
        info!(nickname = %config.nickname, "registration sent");
        Ok(())
    }

    pub async fn join(&mut self, channel: &str) -> Result<()> {
        self.writer
            .send(&Outbound::Join {
                channel: channel.to_string(),
            })
            .await?;
        self.writer.set_state(ConnectionState::Joined).await;
        info!(channel, "joined");
        Ok(())
    }

    /// Waits for the next complete line, without its terminator.
    ///
    /// Keep-alive probes are answered before the line is returned. `None`
    /// means the server closed the connection.
    pub async fn receive_line(&mut self) -> Result<Option<String>> {
        Ok(self.next_frame().await?.map(|(line, _)| line))
    }

    /// Like [`Transport::receive_line`], returning the classified line.
    pub async fn receive(&mut self) -> Result<Option<Inbound>> {
        Ok(self.next_frame().await?.map(|(_, inbound)| inbound))
    }

    async fn next_frame(&mut self) -> Result<Option<(String, Inbound)>> {
        let Some(line) = self.read_frame().await? else {
            return Ok(None);
        };
        let inbound = Inbound::parse(&line);
        answer_probe(&self.writer, &inbound).await?;
        Ok(Some((line, inbound)))
    }

    async fn read_frame(&mut self) -> Result<Option<String>> {
        loop {
            self.buffer.clear();
            let bytes = (&mut self.reader)
                .take(MAX_LINE_LEN as u64)
                .read_until(b'\n', &mut self.buffer)
                .await
                .map_err(Error::Network)?;
            if bytes == 0 {
                return Ok(None);
            }

            if bytes == MAX_LINE_LEN && !self.buffer.ends_with(b"\n") {
                let skipped = self.skip_line().await?;
                warn!(bytes = bytes + skipped, "discarded overlong line");
                continue;
            }

            // Servers are not obliged to send UTF-8; never drop a line over it.
            let line = String::from_utf8_lossy(&self.buffer);
            let line = line.trim_end_matches(LINE_ENDINGS);
            if line.is_empty() {
                continue;
            }

            info!(%line, "received");
            return Ok(Some(line.to_string()));
        }
    }

    /// Consumes input up to and including the next newline, or to EOF.
    async fn skip_line(&mut self) -> Result<usize> {
        let mut skipped = 0;
        loop {
            let (used, done) = {
                let available = self.reader.fill_buf().await.map_err(Error::Network)?;
                match available.iter().position(|byte| *byte == b'\n') {
                    Some(end) => (end + 1, true),
                    None => (available.len(), available.is_empty()),
                }
            };
            self.reader.consume(used);
            skipped += used;
            if done {
                return Ok(skipped);
            }
        }
    }
}

async fn answer_probe<W>(writer: &SessionWriter<W>, inbound: &Inbound) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Inbound::Probe { token } = inbound {
        writer
            .send(&Outbound::Pong {
                token: token.clone(),
            })
            .await?;
        debug!(%token, "answered keep-alive probe");
    }
    Ok(())
}

/// Cloneable handle on the write half of the connection.
pub struct SessionWriter<W> {
    inner: Arc<Mutex<WriteHalf<W>>>,
}

struct WriteHalf<W> {
    writer: W,
    state: ConnectionState,
    closed: bool,
}

impl<W> Clone for SessionWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W> SessionWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WriteHalf {
                writer,
                state: ConnectionState::Disconnected,
                closed: false,
            })),
        }
    }

    /// Encodes and writes one frame, flushing so it leaves immediately.
    pub async fn send(&self, frame: &Outbound) -> Result<()> {
        let mut half = self.inner.lock().await;
        if half.closed {
            return Err(Error::Network(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            )));
        }

        half.writer
            .write_all(frame.encode().as_bytes())
            .await
            .map_err(Error::Network)?;
        half.writer.flush().await.map_err(Error::Network)?;
        debug!(%frame, "sent");
        Ok(())
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.send(&Outbound::privmsg(target, text)).await
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub(crate) async fn set_state(&self, state: ConnectionState) {
        let mut half = self.inner.lock().await;
        if half.state != ConnectionState::Terminating {
            half.state = state;
        }
    }

    /// Tells the server the session is over and closes the write half.
    ///
    /// Best effort: failures and timeouts are logged, never returned.
    pub async fn quit(&self, reason: &str) {
        let attempt = async {
            let mut half = self.inner.lock().await;
            half.state = ConnectionState::Terminating;
            if half.closed {
                return Ok(());
            }
            half.closed = true;

            let frame = Outbound::Quit {
                reason: reason.to_string(),
            };
            half.writer.write_all(frame.encode().as_bytes()).await?;
            half.writer.flush().await?;
            half.writer.shutdown().await
        };

        match timeout(QUIT_TIMEOUT, attempt).await {
            Ok(Ok(())) => info!(reason, "quit sent"),
            Ok(Err(error)) => warn!(?error, "failed to send quit notice"),
            Err(_) => warn!(timeout = ?QUIT_TIMEOUT, "timed out sending quit notice"),
        }
    }
}
