//! End-to-end session flows over the stream transport, against scripted
//! loopback servers.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use parley::{
    ChatError, ClientConfig, Message, ReplyStatus, Session, SessionEvent, SessionState,
    StateCell, Transport,
};

type Engine = JoinHandle<Result<(), ChatError>>;

fn start_session(addr: SocketAddr) -> (Session, Engine, UnboundedReceiver<SessionEvent>) {
    let config = ClientConfig::new("127.0.0.1", addr.port());
    let cancel = CancellationToken::new();
    let state = StateCell::new();
    let transport = Transport::tcp(config, cancel.clone());
    let (session, driver, events) = Session::new(transport, state, cancel);
    (session, tokio::spawn(driver.run()), events)
}

async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> Result<SessionEvent> {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .context("timed out waiting for session event")?
        .context("event stream closed")
}

fn auth() -> Message {
    Message::Auth {
        username: "pepa".into(),
        display_name: "Pepa".into(),
        secret: "s3cret".into(),
    }
}

#[tokio::test]
async fn auth_ok_opens_session_and_relays_messages() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "AUTH pepa AS Pepa USING s3cret"
        );
        write.write_all(b"REPLY OK IS Welcome\r\n").await.unwrap();

        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "MSG FROM Pepa IS hello"
        );
        write.write_all(b"MSG FROM bob IS hi\r\n").await.unwrap();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "BYE");
    });

    let (session, engine, mut events) = start_session(addr);
    assert!(matches!(
        next_event(&mut events).await?,
        SessionEvent::Connected
    ));

    session.send(auth()).await?;
    assert_eq!(session.state(), SessionState::Open);
    match next_event(&mut events).await? {
        SessionEvent::Message(Message::Reply { status, content }) => {
            assert_eq!(status, ReplyStatus::Ok);
            assert_eq!(content, "Welcome");
        }
        other => panic!("expected auth reply, got {other:?}"),
    }

    session
        .send(Message::Msg {
            display_name: "Pepa".into(),
            content: "hello".into(),
        })
        .await?;

    // The server's chat message reaches the caller verbatim.
    match next_event(&mut events).await? {
        SessionEvent::Message(Message::Msg {
            display_name,
            content,
        }) => {
            assert_eq!(display_name, "bob");
            assert_eq!(content, "hi");
        }
        other => panic!("expected chat message, got {other:?}"),
    }

    session.disconnect().await?;
    engine.await??;
    server.await?;
    Ok(())
}

#[tokio::test]
async fn auth_nok_allows_retry() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let first = lines.next_line().await.unwrap().unwrap();
        assert!(first.starts_with("AUTH "));
        write.write_all(b"REPLY NOK IS bad secret\r\n").await.unwrap();

        let second = lines.next_line().await.unwrap().unwrap();
        assert!(second.starts_with("AUTH "));
        write.write_all(b"REPLY OK IS Welcome\r\n").await.unwrap();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "BYE");
    });

    let (session, engine, events) = start_session(addr);

    session.send(auth()).await?;
    assert_eq!(session.state(), SessionState::WaitForAuth);

    session.send(auth()).await?;
    assert_eq!(session.state(), SessionState::Open);

    session.disconnect().await?;
    engine.await??;
    server.await?;
    drop(events);
    Ok(())
}

#[tokio::test]
async fn join_completes_on_reply_and_repeated_auth_is_rejected() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let first = lines.next_line().await.unwrap().unwrap();
        assert!(first.starts_with("AUTH "));
        write.write_all(b"REPLY OK IS Welcome\r\n").await.unwrap();

        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "JOIN general AS Pepa"
        );
        write.write_all(b"REPLY OK IS Joined\r\n").await.unwrap();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "BYE");
    });

    let (session, engine, mut events) = start_session(addr);
    session.send(auth()).await?;
    assert_eq!(session.state(), SessionState::Open);

    // A second Auth is illegal once the session is open.
    let err = session.send(auth()).await.unwrap_err();
    assert!(matches!(
        err,
        ChatError::InvalidInput {
            state: SessionState::Open,
            kind: "AUTH",
        }
    ));

    // Join blocks until the server's Reply arrives.
    session
        .send(Message::Join {
            channel_id: "general".into(),
            display_name: "Pepa".into(),
        })
        .await?;
    assert_eq!(session.state(), SessionState::Open);

    // Both replies surface to the caller, in order.
    let mut contents = Vec::new();
    while contents.len() < 2 {
        match next_event(&mut events).await? {
            SessionEvent::Connected => continue,
            SessionEvent::Message(Message::Reply { status, content }) => {
                assert_eq!(status, ReplyStatus::Ok);
                contents.push(content);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(contents, ["Welcome", "Joined"]);

    session.disconnect().await?;
    engine.await??;
    server.await?;
    Ok(())
}

#[tokio::test]
async fn refused_send_leaves_the_state_untouched() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let (session, engine, _events) = start_session(addr);
    // Tear the session down before anything is sent.
    session.disconnect().await?;
    engine.await??;
    // Let the transport driver finish and drop its end of the channel.
    sleep(Duration::from_millis(50)).await;

    let err = session.send(auth()).await.unwrap_err();
    assert!(matches!(err, ChatError::Cancelled));
    assert_eq!(session.state(), SessionState::Start);
    Ok(())
}

#[tokio::test]
async fn illegal_sends_fail_without_transmission() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    // Accept the connection but never speak.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // Hold the socket open until the client leaves.
        let mut lines = BufReader::new(stream).lines();
        assert_eq!(lines.next_line().await.unwrap(), None);
    });

    let (session, engine, _events) = start_session(addr);

    let err = session
        .send(Message::Msg {
            display_name: "Pepa".into(),
            content: "too early".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChatError::InvalidInput {
            state: SessionState::Start,
            kind: "MSG",
        }
    ));

    // Bye before authenticating is illegal too.
    let err = session.send(Message::Bye).await.unwrap_err();
    assert!(matches!(err, ChatError::InvalidInput { .. }));

    session.disconnect().await?;
    engine.await??;
    server.await?;
    Ok(())
}

#[tokio::test]
async fn field_violations_are_caught_before_state_checks() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (session, engine, _events) = start_session(addr);

    let err = session
        .send(Message::Auth {
            username: "pepa novak".into(),
            display_name: "Pepa".into(),
            secret: "s3cret".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::FieldConstraintViolation { .. }));
    assert_eq!(session.state(), SessionState::Start);

    session.disconnect().await?;
    engine.await??;
    Ok(())
}

#[tokio::test]
async fn unexpected_inbound_sends_err_and_terminates() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let _auth = lines.next_line().await.unwrap().unwrap();
        write.write_all(b"REPLY OK IS Welcome\r\n").await.unwrap();

        // A Join from the server is never expected client-side.
        write.write_all(b"JOIN general AS bob\r\n").await.unwrap();

        let err_line = lines.next_line().await.unwrap().unwrap();
        assert!(err_line.starts_with("ERR FROM Pepa IS "), "got: {err_line}");
    });

    let (session, engine, _events) = start_session(addr);
    session.send(auth()).await?;

    let fatal = engine.await?.unwrap_err();
    assert!(matches!(fatal, ChatError::InvalidMessageReceived(_)));
    assert_eq!(session.state(), SessionState::End);
    server.await?;
    Ok(())
}

#[tokio::test]
async fn malformed_line_sends_err_and_terminates() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"HELLO THERE\r\n").await.unwrap();
        let err_line = lines.next_line().await.unwrap().unwrap();
        assert!(err_line.starts_with("ERR FROM "), "got: {err_line}");
    });

    let (_session, engine, _events) = start_session(addr);
    let fatal = engine.await?.unwrap_err();
    assert!(matches!(fatal, ChatError::InvalidMessageReceived(_)));
    server.await?;
    Ok(())
}

#[tokio::test]
async fn server_error_terminates_without_response() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let _auth = lines.next_line().await.unwrap().unwrap();
        write.write_all(b"REPLY OK IS Welcome\r\n").await.unwrap();
        write.write_all(b"ERR FROM server IS boom\r\n").await.unwrap();

        // The client closes without sending anything further.
        assert_eq!(lines.next_line().await.unwrap(), None);
    });

    let (session, engine, _events) = start_session(addr);
    session.send(auth()).await?;

    let fatal = engine.await?.unwrap_err();
    match fatal {
        ChatError::ServerException {
            display_name,
            content,
        } => {
            assert_eq!(display_name, "server");
            assert_eq!(content, "boom");
        }
        other => panic!("expected server exception, got {other:?}"),
    }
    server.await?;
    Ok(())
}

#[tokio::test]
async fn closed_stream_is_server_unreachable() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let (_session, engine, _events) = start_session(addr);
    let fatal = engine.await?.unwrap_err();
    assert!(matches!(fatal, ChatError::ServerUnreachable(_)));
    server.await?;
    Ok(())
}

#[tokio::test]
async fn server_bye_ends_the_session_cleanly() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let _auth = lines.next_line().await.unwrap().unwrap();
        write.write_all(b"REPLY OK IS Welcome\r\n").await.unwrap();
        write.write_all(b"BYE\r\n").await.unwrap();
    });

    let (session, engine, _events) = start_session(addr);
    session.send(auth()).await?;

    engine.await??;
    assert_eq!(session.state(), SessionState::End);
    server.await?;
    Ok(())
}
