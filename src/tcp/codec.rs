//! CRLF-terminated text framing for the stream transport.
//!
//! One message per line, keyword-prefixed and space-separated:
//!
//! ```text
//! AUTH <username> AS <displayName> USING <secret>
//! JOIN <channelId> AS <displayName>
//! MSG FROM <displayName> IS <content...>
//! ERR FROM <displayName> IS <content...>
//! REPLY OK|NOK IS <content...>
//! BYE
//! ```
//!
//! Keywords are matched case-insensitively on decode; payload case is
//! preserved.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{ChatError, Message, ReplyStatus};

/// Upper bound on one line; anything longer than the largest legal message
/// plus keyword overhead is malformed.
const MAX_LINE: usize = 2048;

#[derive(Debug, Default)]
pub struct LineCodec;

impl Encoder<Message> for LineCodec {
    type Error = ChatError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), ChatError> {
        let line = match message {
            Message::Auth {
                username,
                display_name,
                secret,
            } => format!("AUTH {username} AS {display_name} USING {secret}"),
            Message::Join {
                channel_id,
                display_name,
            } => format!("JOIN {channel_id} AS {display_name}"),
            Message::Msg {
                display_name,
                content,
            } => format!("MSG FROM {display_name} IS {content}"),
            Message::Err {
                display_name,
                content,
            } => format!("ERR FROM {display_name} IS {content}"),
            Message::Reply { status, content } => {
                let status = match status {
                    ReplyStatus::Ok => "OK",
                    ReplyStatus::Nok => "NOK",
                };
                format!("REPLY {status} IS {content}")
            }
            Message::Bye => "BYE".to_string(),
        };

        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

impl Decoder for LineCodec {
    type Item = Message;
    type Error = ChatError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ChatError> {
        let Some(end) = src.windows(2).position(|w| w == b"\r\n") else {
            if src.len() > MAX_LINE {
                return Err(ChatError::InvalidMessageReceived(
                    "line exceeds maximum length".into(),
                ));
            }
            return Ok(None);
        };

        let line = src.split_to(end);
        src.advance(2);

        let line = std::str::from_utf8(&line).map_err(|_| {
            ChatError::InvalidMessageReceived("line is not valid ASCII text".into())
        })?;
        parse_line(line).map(Some)
    }
}

fn parse_line(line: &str) -> Result<Message, ChatError> {
    let parts: Vec<&str> = line.split(' ').collect();
    let upper: Vec<String> = parts.iter().map(|p| p.to_ascii_uppercase()).collect();
    let keyword = upper.first().map(String::as_str).unwrap_or("");

    let message = match keyword {
        "AUTH" if parts.len() == 6 && upper[2] == "AS" && upper[4] == "USING" => Message::Auth {
            username: parts[1].to_string(),
            display_name: parts[3].to_string(),
            secret: parts[5].to_string(),
        },
        "JOIN" if parts.len() == 4 && upper[2] == "AS" => Message::Join {
            channel_id: parts[1].to_string(),
            display_name: parts[3].to_string(),
        },
        "MSG" if parts.len() >= 4 && upper[1] == "FROM" && upper[3] == "IS" => Message::Msg {
            display_name: parts[2].to_string(),
            content: parts[4..].join(" "),
        },
        "ERR" if parts.len() >= 4 && upper[1] == "FROM" && upper[3] == "IS" => Message::Err {
            display_name: parts[2].to_string(),
            content: parts[4..].join(" "),
        },
        "REPLY" if parts.len() >= 3 && upper[2] == "IS" => {
            let status = match upper[1].as_str() {
                "OK" => ReplyStatus::Ok,
                "NOK" => ReplyStatus::Nok,
                other => {
                    return Err(ChatError::InvalidMessageReceived(format!(
                        "unknown reply status: {other}"
                    )))
                }
            };
            Message::Reply {
                status,
                content: parts[3..].join(" "),
            }
        }
        "BYE" if parts.len() == 1 => Message::Bye,
        _ => {
            return Err(ChatError::InvalidMessageReceived(format!(
                "unrecognized line: {line}"
            )))
        }
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: Message) -> String {
        let mut codec = LineCodec;
        let mut buf = BytesMut::new();
        codec.encode(message, &mut buf).expect("encode");
        String::from_utf8(buf.to_vec()).expect("ascii")
    }

    fn decode(line: &str) -> Result<Option<Message>, ChatError> {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(line);
        codec.decode(&mut buf)
    }

    #[test]
    fn encodes_grammar_lines() {
        let auth = Message::Auth {
            username: "pepa".into(),
            display_name: "Pepa".into(),
            secret: "s3cret".into(),
        };
        assert_eq!(encode(auth), "AUTH pepa AS Pepa USING s3cret\r\n");

        let msg = Message::Msg {
            display_name: "bob".into(),
            content: "hello there".into(),
        };
        assert_eq!(encode(msg), "MSG FROM bob IS hello there\r\n");

        assert_eq!(encode(Message::Bye), "BYE\r\n");
    }

    #[test]
    fn round_trips_every_kind() {
        let messages = [
            Message::Auth {
                username: "pepa".into(),
                display_name: "Pepa_z_Brna".into(),
                secret: "1234-5678".into(),
            },
            Message::Join {
                channel_id: "general".into(),
                display_name: "Pepa".into(),
            },
            Message::Msg {
                display_name: "bob".into(),
                content: "hi with  double space".into(),
            },
            Message::Err {
                display_name: "server".into(),
                content: "boom".into(),
            },
            Message::Reply {
                status: ReplyStatus::Nok,
                content: "bad secret".into(),
            },
            Message::Bye,
        ];

        for message in messages {
            let line = encode(message.clone());
            let decoded = decode(&line).expect("decode").expect("complete frame");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn keywords_are_case_insensitive_payload_is_not() {
        let decoded = decode("msg from Bob is Hello\r\n")
            .expect("decode")
            .expect("frame");
        assert_eq!(
            decoded,
            Message::Msg {
                display_name: "Bob".into(),
                content: "Hello".into(),
            }
        );
    }

    #[test]
    fn empty_content_is_accepted() {
        let decoded = decode("MSG FROM bob IS\r\n").expect("decode").expect("frame");
        assert_eq!(
            decoded,
            Message::Msg {
                display_name: "bob".into(),
                content: String::new(),
            }
        );
    }

    #[test]
    fn partial_line_yields_none() {
        assert!(decode("MSG FROM bob IS hi").expect("decode").is_none());
        // CR alone is not a terminator.
        assert!(decode("BYE\r").expect("decode").is_none());
    }

    #[test]
    fn unrecognized_lines_are_rejected() {
        for line in [
            "HELLO there\r\n",
            "AUTH pepa USING s3cret\r\n",
            "REPLY MAYBE IS hmm\r\n",
            "BYE now\r\n",
            "\r\n",
        ] {
            let err = decode(line).expect_err("should reject");
            assert!(matches!(err, ChatError::InvalidMessageReceived(_)));
        }
    }

    #[test]
    fn consumes_bad_line_and_continues() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from("GARBAGE\r\nBYE\r\n");
        assert!(codec.decode(&mut buf).is_err());
        let next = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(next, Message::Bye);
    }
}
