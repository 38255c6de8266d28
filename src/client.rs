//! Thin interactive client: turns stdin commands into protocol calls and
//! prints received messages. All protocol logic lives in [`crate::session`].

use std::io;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::session::{Session, SessionDriver, SessionEvent};
use crate::types::{ChatError, Message, ReplyStatus};

enum UserCommand {
    Auth {
        username: String,
        secret: String,
        display_name: String,
    },
    Join {
        channel_id: String,
    },
    Rename {
        display_name: String,
    },
    Help,
    Chat(String),
}

/// Runs the interactive loop until the session ends. The returned result is
/// the session's: `Ok` for a clean end or cancellation, the fatal condition
/// otherwise.
pub async fn run(
    session: Session,
    driver: SessionDriver,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) -> Result<(), ChatError> {
    let mut driver_task = tokio::spawn(driver.run());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut display_name = String::from("client");

    loop {
        tokio::select! {
            finished = &mut driver_task => {
                return finished.unwrap_or_else(|e| Err(ChatError::Io(io::Error::other(e))));
            }

            event = events.recv() => {
                if let Some(event) = event {
                    render(&event);
                }
            }

            line = lines.next_line() => match line? {
                Some(line) => handle_line(&session, &mut display_name, &line).await?,
                // Stdin closed: leave gracefully.
                None => {
                    let _ = session.disconnect().await;
                }
            },

            interrupt = tokio::signal::ctrl_c() => {
                if let Err(e) = interrupt {
                    warn!(error = %e, "ctrl-c handler failed");
                }
                let _ = session.disconnect().await;
            }
        }
    }
}

async fn handle_line(
    session: &Session,
    display_name: &mut String,
    line: &str,
) -> Result<(), ChatError> {
    let line = line.trim_end();
    if line.is_empty() {
        return Ok(());
    }

    let command = match parse_command(line) {
        Ok(command) => command,
        Err(usage) => {
            eprintln!("ERROR: {usage}");
            return Ok(());
        }
    };

    let outcome = match command {
        UserCommand::Auth {
            username,
            secret,
            display_name: name,
        } => {
            let result = session
                .send(Message::Auth {
                    username,
                    display_name: name.clone(),
                    secret,
                })
                .await;
            if result.is_ok() {
                *display_name = name;
            }
            result
        }
        UserCommand::Join { channel_id } => {
            session
                .send(Message::Join {
                    channel_id,
                    display_name: display_name.clone(),
                })
                .await
        }
        UserCommand::Rename {
            display_name: name,
        } => {
            *display_name = name;
            Ok(())
        }
        UserCommand::Help => {
            print_help();
            Ok(())
        }
        UserCommand::Chat(content) => {
            session
                .send(Message::Msg {
                    display_name: display_name.clone(),
                    content,
                })
                .await
        }
    };

    match outcome {
        Ok(()) => Ok(()),
        // Local, recoverable: tell the user and keep the session alive.
        Err(
            e @ (ChatError::FieldConstraintViolation { .. } | ChatError::InvalidInput { .. }),
        ) => {
            eprintln!("ERROR: {e}");
            Ok(())
        }
        // The session is tearing down; its driver reports the real cause.
        Err(ChatError::Cancelled) => Ok(()),
        Err(e) => Err(e),
    }
}

fn parse_command(line: &str) -> Result<UserCommand, String> {
    if !line.starts_with('/') {
        return Ok(UserCommand::Chat(line.to_string()));
    }

    let mut parts = line.split(' ');
    let keyword = parts.next().unwrap_or("");
    let args: Vec<&str> = parts.collect();

    match keyword {
        "/auth" => match args.as_slice() {
            [username, secret, display_name] => Ok(UserCommand::Auth {
                username: username.to_string(),
                secret: secret.to_string(),
                display_name: display_name.to_string(),
            }),
            _ => Err("usage: /auth {username} {secret} {displayName}".into()),
        },
        "/join" => match args.as_slice() {
            [channel_id] => Ok(UserCommand::Join {
                channel_id: channel_id.to_string(),
            }),
            _ => Err("usage: /join {channelId}".into()),
        },
        "/rename" => match args.as_slice() {
            [display_name] => Ok(UserCommand::Rename {
                display_name: display_name.to_string(),
            }),
            _ => Err("usage: /rename {displayName}".into()),
        },
        "/help" => Ok(UserCommand::Help),
        other => Err(format!("unknown command: {other}")),
    }
}

fn render(event: &SessionEvent) {
    match event {
        SessionEvent::Connected => eprintln!("Connected to server"),
        SessionEvent::Message(Message::Msg {
            display_name,
            content,
        }) => println!("{display_name}: {content}"),
        SessionEvent::Message(Message::Reply { status, content }) => match status {
            ReplyStatus::Ok => eprintln!("Action success: {content}"),
            ReplyStatus::Nok => eprintln!("Action failure: {content}"),
        },
        SessionEvent::Message(_) => {}
    }
}

fn print_help() {
    eprintln!("/auth {{username}} {{secret}} {{displayName}}  authenticate");
    eprintln!("/join {{channelId}}                          join a channel");
    eprintln!("/rename {{displayName}}                      change the local display name");
    eprintln!("/help                                      show this help");
    eprintln!("anything else is sent as a chat message");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_chat() {
        assert!(matches!(
            parse_command("hello world").unwrap(),
            UserCommand::Chat(text) if text == "hello world"
        ));
    }

    #[test]
    fn auth_command_needs_three_arguments() {
        assert!(matches!(
            parse_command("/auth pepa s3cret Pepa").unwrap(),
            UserCommand::Auth { .. }
        ));
        assert!(parse_command("/auth pepa s3cret").is_err());
        assert!(parse_command("/auth pepa s3cret Pepa extra").is_err());
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(parse_command("/quit").is_err());
    }
}
