//! Integration tests for the IRC session against an in-process fake server.
//!
//! The fake server is a plain `TcpListener` that scripts the server side of
//! the conversation line by line.

use std::time::Duration;

use ircboard::irc::{IrcError, IrcSession, IrcSettings, SessionEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct FakeServer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakeServer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn expect_line(&mut self) -> String {
        tokio::time::timeout(STEP_TIMEOUT, self.lines.next_line())
            .await
            .expect("client went quiet")
            .unwrap()
            .expect("client closed the connection")
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    /// Reads the NICK/USER handshake and completes registration.
    async fn register(&mut self) {
        assert_eq!(self.expect_line().await, "NICK ForumBot");
        assert_eq!(self.expect_line().await, "USER forumbot 8 * :phpBB IRC bot");
        self.send(":irc.test 001 ForumBot :Welcome").await;
        self.send(":irc.test 376 ForumBot :End of /MOTD command.").await;
        assert_eq!(self.expect_line().await, "JOIN #forum");
    }
}

fn settings(port: u16) -> IrcSettings {
    IrcSettings {
        host: "127.0.0.1".into(),
        port,
        secure: false,
        password: None,
        autoreconnect: false,
        nickname: "ForumBot".into(),
        username: "forumbot".into(),
        realname: "phpBB IRC bot".into(),
        invisible: true,
        nickserv_password: None,
        channels: vec!["#forum".into()],
    }
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn test_registration_relay_and_quit() {
    let (listener, port) = listener().await;
    let (session, handle, mut events) = IrcSession::new(settings(port));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    let mut server = FakeServer::accept(&listener).await;
    server.register().await;

    let event = tokio::time::timeout(STEP_TIMEOUT, events.recv()).await.unwrap();
    assert_eq!(event, Some(SessionEvent::Registered));

    handle.privmsg("#forum", "\x02New post\x02: Hello by alice - https://x/1").unwrap();
    assert_eq!(
        server.expect_line().await,
        "PRIVMSG #forum :\x02New post\x02: Hello by alice - https://x/1"
    );

    server.send("PING :irc.test").await;
    assert_eq!(server.expect_line().await, "PONG irc.test");

    cancel.cancel();
    assert_eq!(server.expect_line().await, "QUIT :Shutting down");

    let result = tokio::time::timeout(STEP_TIMEOUT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_messages_queued_before_registration_follow_join() {
    let (listener, port) = listener().await;
    let (session, handle, _events) = IrcSession::new(settings(port));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    handle.privmsg("#forum", "early").unwrap();

    let mut server = FakeServer::accept(&listener).await;
    server.register().await;
    assert_eq!(server.expect_line().await, "PRIVMSG #forum early");

    cancel.cancel();
    let _ = tokio::time::timeout(STEP_TIMEOUT, task).await.unwrap();
}

#[tokio::test]
async fn test_nickname_in_use_retries_with_backtick() {
    let (listener, port) = listener().await;
    let (session, _handle, _events) = IrcSession::new(settings(port));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    let mut server = FakeServer::accept(&listener).await;
    assert_eq!(server.expect_line().await, "NICK ForumBot");
    server.expect_line().await; // USER
    server
        .send(":irc.test 433 * ForumBot :Nickname is already in use")
        .await;
    assert_eq!(server.expect_line().await, "NICK ForumBot`");

    cancel.cancel();
    let _ = tokio::time::timeout(STEP_TIMEOUT, task).await.unwrap();
}

#[tokio::test]
async fn test_invite_to_configured_channel_is_accepted() {
    let (listener, port) = listener().await;
    let (session, _handle, _events) = IrcSession::new(settings(port));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    let mut server = FakeServer::accept(&listener).await;
    server.register().await;
    server.send(":ChanServ!ChanServ@services. INVITE ForumBot :#FORUM").await;
    assert_eq!(server.expect_line().await, "JOIN #FORUM");

    cancel.cancel();
    let _ = tokio::time::timeout(STEP_TIMEOUT, task).await.unwrap();
}

#[tokio::test]
async fn test_server_password_sent_first() {
    let (listener, port) = listener().await;
    let mut settings = settings(port);
    settings.password = Some("letmein".into());
    let (session, _handle, _events) = IrcSession::new(settings);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    let mut server = FakeServer::accept(&listener).await;
    assert_eq!(server.expect_line().await, "PASS letmein");
    assert_eq!(server.expect_line().await, "NICK ForumBot");

    cancel.cancel();
    let _ = tokio::time::timeout(STEP_TIMEOUT, task).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_without_autoreconnect_ends_session() {
    let (listener, port) = listener().await;
    let (session, _handle, mut events) = IrcSession::new(settings(port));
    let task = tokio::spawn(session.run(CancellationToken::new()));

    let mut server = FakeServer::accept(&listener).await;
    server.register().await;
    assert_eq!(events.recv().await, Some(SessionEvent::Registered));
    drop(server);

    let event = tokio::time::timeout(STEP_TIMEOUT, events.recv()).await.unwrap();
    assert!(matches!(event, Some(SessionEvent::Disconnected { .. })));

    let result = tokio::time::timeout(STEP_TIMEOUT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(IrcError::Closed)));
}

#[tokio::test]
async fn test_connection_refused_is_reported() {
    // Bind then drop to get a port with nothing listening
    let (listener, port) = listener().await;
    drop(listener);

    let (session, _handle, _events) = IrcSession::new(settings(port));
    let result = tokio::time::timeout(STEP_TIMEOUT, session.run(CancellationToken::new()))
        .await
        .unwrap();
    assert!(matches!(result, Err(IrcError::Io(_))));
}

#[tokio::test]
async fn test_reconnect_registers_again_and_flushes_queue() {
    let (listener, port) = listener().await;
    let mut settings = settings(port);
    settings.autoreconnect = true;
    let (session, handle, mut events) = IrcSession::new(settings);
    let session = session.with_reconnect_delay(Duration::from_millis(50));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    let mut first = FakeServer::accept(&listener).await;
    first.register().await;
    let event = tokio::time::timeout(STEP_TIMEOUT, events.recv()).await.unwrap();
    assert_eq!(event, Some(SessionEvent::Registered));
    drop(first);

    let event = tokio::time::timeout(STEP_TIMEOUT, events.recv()).await.unwrap();
    assert!(matches!(event, Some(SessionEvent::Disconnected { .. })));

    // Queued while no connection exists
    handle.privmsg("#forum", "queued").unwrap();

    let mut second = FakeServer::accept(&listener).await;
    second.register().await;
    assert_eq!(second.expect_line().await, "PRIVMSG #forum queued");
    let event = tokio::time::timeout(STEP_TIMEOUT, events.recv()).await.unwrap();
    assert_eq!(event, Some(SessionEvent::Registered));

    cancel.cancel();
    assert_eq!(second.expect_line().await, "QUIT :Shutting down");
    let result = tokio::time::timeout(STEP_TIMEOUT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_cancel_during_reconnect_delay_ends_cleanly() {
    let (listener, port) = listener().await;
    let mut settings = settings(port);
    settings.autoreconnect = true;
    let (session, _handle, mut events) = IrcSession::new(settings);
    let session = session.with_reconnect_delay(Duration::from_secs(3600));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(session.run(cancel.clone()));

    let mut server = FakeServer::accept(&listener).await;
    server.register().await;
    drop(server);

    // Registered, then Disconnected
    loop {
        let event = tokio::time::timeout(STEP_TIMEOUT, events.recv()).await.unwrap();
        if matches!(event, Some(SessionEvent::Disconnected { .. })) {
            break;
        }
    }

    cancel.cancel();
    let result = tokio::time::timeout(STEP_TIMEOUT, task)
        .await
        .expect("cancel should cut the reconnect delay short")
        .unwrap();
    assert!(result.is_ok());
}
