use std::{collections::BTreeMap, fs, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use karma_bot::{
    Error, KarmaStore, SessionConfig,
    session::{self, SessionEnd},
    transport::{self, Transport},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf, duplex},
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const PIPE_CAPACITY: usize = 16 * 1024;

fn config() -> SessionConfig {
    SessionConfig {
        server: "127.0.0.1".into(),
        port: 6667,
        nickname: "karmabot".into(),
        username: "karma".into(),
        channel: "#karma".into(),
        quit_message: "bye".into(),
    }
}

/// The server end of a session, speaking raw protocol lines.
struct FakeServer<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R, W> FakeServer<R, W>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let bytes = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for a line from the bot"))??;
        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    async fn expect_line(&mut self) -> Result<String> {
        self.next_line()
            .await?
            .ok_or_else(|| anyhow!("bot closed the connection"))
    }

    async fn expect_handshake(&mut self) -> Result<()> {
        assert_eq!(self.expect_line().await?, "USER karma 8 * :karma");
        assert_eq!(self.expect_line().await?, "NICK karmabot");
        assert_eq!(self.expect_line().await?, "JOIN #karma");
        assert_eq!(
            self.expect_line().await?,
            format!("PRIVMSG #karma :karmabot version {} reporting for duty.", karma_bot::VERSION)
        );
        Ok(())
    }
}

type DuplexServer = FakeServer<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

struct Harness {
    server: DuplexServer,
    store: Arc<KarmaStore>,
    shutdown: Option<oneshot::Sender<()>>,
    session: JoinHandle<karma_bot::Result<SessionEnd>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(entries: &[(&str, i64)]) -> Result<Self> {
        Self::start_with_capacity(entries, PIPE_CAPACITY).await
    }

    async fn start_with_capacity(entries: &[(&str, i64)], capacity: usize) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let entries: BTreeMap<String, i64> = entries
            .iter()
            .map(|(handle, score)| (handle.to_string(), *score))
            .collect();
        let store = KarmaStore::with_entries(dir.path().join("karma.json"), entries);
        Self::start_on(store, dir, capacity).await
    }

    async fn start_with_store(store: KarmaStore, dir: tempfile::TempDir) -> Result<Self> {
        Self::start_on(store, dir, PIPE_CAPACITY).await
    }

    async fn start_on(store: KarmaStore, dir: tempfile::TempDir, capacity: usize) -> Result<Self> {
        let (bot_side, server_side) = duplex(capacity);
        let (bot_reader, bot_writer) = tokio::io::split(bot_side);
        let (server_reader, server_writer) = tokio::io::split(server_side);

        let config = Arc::new(config());
        let store = Arc::new(store);

        let mut transport = Transport::new(BufReader::new(bot_reader), bot_writer);
        transport.register(&config).await?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let session = tokio::spawn(session::run(
            transport,
            config,
            Arc::clone(&store),
            async move {
                let _ = shutdown_rx.await;
            },
        ));

        let mut server = FakeServer {
            reader: BufReader::new(server_reader),
            writer: server_writer,
        };
        server.expect_handshake().await?;

        Ok(Self {
            server,
            store,
            shutdown: Some(shutdown_tx),
            session,
            _dir: dir,
        })
    }

    async fn stop(mut self) -> Result<SessionEnd> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        assert_eq!(self.server.expect_line().await?, "QUIT :bye");
        assert_eq!(self.server.next_line().await?, None);
        Ok(self.session.await??)
    }
}

#[tokio::test]
async fn increment_replies_after_persisting() -> Result<()> {
    let mut harness = Harness::start(&[("alice", 3), ("bob", -1)]).await?;

    harness
        .server
        .send(":carol!c@example.net PRIVMSG #karma :alice++")
        .await?;
    assert_eq!(
        harness.server.expect_line().await?,
        "PRIVMSG #karma :Karma for alice now 4"
    );

    assert_eq!(harness.store.query("alice"), 4);
    let on_disk = KarmaStore::load(harness.store.path())?;
    assert_eq!(on_disk.query("alice"), 4);
    assert_eq!(on_disk.query("bob"), -1);

    assert_eq!(harness.stop().await?, SessionEnd::Shutdown);
    Ok(())
}

#[tokio::test]
async fn decrement_in_a_private_message_is_answered_privately() -> Result<()> {
    let mut harness = Harness::start(&[]).await?;

    harness
        .server
        .send(":carol!c@example.net PRIVMSG karmabot :flaky tests--")
        .await?;
    assert_eq!(
        harness.server.expect_line().await?,
        "PRIVMSG carol :Karma for tests now -1"
    );

    harness.stop().await?;
    Ok(())
}

#[tokio::test]
async fn topten_lists_highest_first() -> Result<()> {
    let mut harness = Harness::start(&[("a", 5), ("b", 9), ("c", 1)]).await?;

    harness
        .server
        .send(":dave!d@example.net PRIVMSG #karma :karmabot topten")
        .await?;
    for expected in ["b is 9", "a is 5", "c is 1"] {
        assert_eq!(
            harness.server.expect_line().await?,
            format!("PRIVMSG #karma :Karma for {expected}.")
        );
    }

    harness.stop().await?;
    Ok(())
}

#[tokio::test]
async fn query_answers_each_handle_in_order() -> Result<()> {
    let mut harness = Harness::start(&[("a", 5)]).await?;

    harness
        .server
        .send(":dave!d@example.net PRIVMSG #karma :karmabot query a b")
        .await?;
    assert_eq!(
        harness.server.expect_line().await?,
        "PRIVMSG #karma :Karma for a is 5."
    );
    assert_eq!(
        harness.server.expect_line().await?,
        "PRIVMSG #karma :Karma for b is 0."
    );
    assert_eq!(harness.store.len(), 1, "queries never create entries");

    harness.stop().await?;
    Ok(())
}

#[tokio::test]
async fn keepalive_is_answered_by_the_next_write() -> Result<()> {
    let mut harness = Harness::start(&[]).await?;

    harness.server.send("PING :irc.example.net").await?;
    assert_eq!(
        harness.server.expect_line().await?,
        "PONG :irc.example.net"
    );

    harness.stop().await?;
    Ok(())
}

#[tokio::test]
async fn ignored_lines_produce_no_output() -> Result<()> {
    let mut harness = Harness::start(&[]).await?;

    for line in [
        ":karmabot!k@example.net PRIVMSG #karma :alice++",
        ":carol PRIVMSG",
        ":carol PRIVMSG #karma",
        "PING",
        ":carol!c@example.net PRIVMSG #karma :karmabot dance",
        ":carol!c@example.net PRIVMSG #karma :just chatting",
        ":irc.example.net 372 karmabot :- message of the day",
    ] {
        harness.server.send(line).await?;
    }
    // Anything the lines above triggered would arrive before this answer.
    harness.server.send("PING :marker").await?;
    assert_eq!(harness.server.expect_line().await?, "PONG :marker");
    assert!(harness.store.is_empty());

    harness.stop().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_flushes_and_closes_the_store() -> Result<()> {
    let mut harness = Harness::start(&[("alice", 1)]).await?;
    let path = harness.store.path().to_path_buf();

    harness
        .server
        .send(":carol!c@example.net PRIVMSG #karma :bob++")
        .await?;
    harness.server.expect_line().await?;

    let store = Arc::clone(&harness.store);
    // Keep the scratch directory alive past `stop`, which drops the harness.
    let _dir = std::mem::replace(&mut harness._dir, tempfile::tempdir()?);
    assert_eq!(harness.stop().await?, SessionEnd::Shutdown);

    assert!(store.is_closed());
    let on_disk: BTreeMap<String, i64> = serde_json::from_str(&fs::read_to_string(path)?)?;
    assert_eq!(
        on_disk,
        BTreeMap::from([("alice".to_string(), 1), ("bob".to_string(), 1)])
    );
    Ok(())
}

#[tokio::test]
async fn shutdown_is_not_blocked_by_a_server_that_stopped_reading() -> Result<()> {
    let handles: Vec<String> = (0..10).map(|i| format!("someone{i}")).collect();
    let entries: Vec<(&str, i64)> = handles
        .iter()
        .zip(0..)
        .map(|(handle, score)| (handle.as_str(), score))
        .collect();
    // Ten ranking lines do not fit in the pipe once the server stops reading.
    let mut harness = Harness::start_with_capacity(&entries, 256).await?;
    harness
        .server
        .send(":dave!d@example.net PRIVMSG #karma :karmabot topten")
        .await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let Harness {
        server: _server,
        store,
        shutdown,
        session,
        _dir,
    } = harness;
    if let Some(shutdown) = shutdown {
        let _ = shutdown.send(());
    }

    let end = timeout(Duration::from_secs(6), session)
        .await
        .map_err(|_| anyhow!("session ignored shutdown while a reply was stuck"))???;
    assert_eq!(end, SessionEnd::Shutdown);
    assert!(store.is_closed());
    Ok(())
}

#[tokio::test]
async fn server_hangup_ends_the_session() -> Result<()> {
    let harness = Harness::start(&[]).await?;
    let Harness {
        server,
        store,
        session,
        shutdown: _shutdown,
        _dir,
    } = harness;

    drop(server);

    let end = timeout(READ_TIMEOUT, session).await???;
    assert_eq!(end, SessionEnd::Disconnected);
    assert!(store.is_closed());
    Ok(())
}

#[tokio::test]
async fn persist_failure_is_fatal_and_unanswered() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // A non-empty directory where the karma file should be makes every save fail.
    let path = dir.path().join("karma.json");
    fs::create_dir(&path)?;
    fs::write(path.join("occupant"), "x")?;

    let store = KarmaStore::with_entries(&path, BTreeMap::new());
    let mut harness = Harness::start_with_store(store, dir).await?;

    harness
        .server
        .send(":carol!c@example.net PRIVMSG #karma :alice++")
        .await?;

    // No reply: the next thing the server hears is the goodbye.
    assert_eq!(harness.server.expect_line().await?, "QUIT :bye");
    assert_eq!(harness.server.next_line().await?, None);

    let err = harness.session.await?.expect_err("persist failure must end the session");
    assert!(matches!(err, Error::Io { .. }), "unexpected error: {err:?}");
    Ok(())
}

#[tokio::test]
async fn connects_and_registers_over_tcp() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let config = SessionConfig {
        port: addr.port(),
        ..config()
    };

    let accept = tokio::spawn(async move { listener.accept().await });
    let transport = transport::connect(&config).await?;
    let (stream, _) = accept.await??;
    let (reader, writer) = stream.into_split();
    let mut server = FakeServer {
        reader: BufReader::new(reader),
        writer,
    };

    let dir = tempfile::tempdir()?;
    let store = Arc::new(KarmaStore::load(dir.path().join("karma.json"))?);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let session = tokio::spawn(session::run(
        transport,
        Arc::new(config),
        Arc::clone(&store),
        async move {
            let _ = shutdown_rx.await;
        },
    ));

    server.expect_handshake().await?;
    server.send(":irc.example.net 001 karmabot :Welcome").await?;
    server.send(":erin!e@example.net PRIVMSG #karma :rust++").await?;
    assert_eq!(
        server.expect_line().await?,
        "PRIVMSG #karma :Karma for rust now 1"
    );

    let _ = shutdown_tx.send(());
    assert_eq!(server.expect_line().await?, "QUIT :bye");
    assert_eq!(session.await??, SessionEnd::Shutdown);
    assert_eq!(KarmaStore::load(store.path())?.query("rust"), 1);
    Ok(())
}
