//! Interactive stdio mode: a `/command` REPL with human-formatted output.
//!
//! Background events interrupt the prompt and are reprinted above it. QR
//! pairing renders the code as a Unicode block right in the terminal.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use wabridge_core::error::BridgeError;
use wabridge_core::event::EventPayload;
use wabridge_session::PairingUpdate;

use crate::messaging::MessageService;

const HELP: &str = "\
Commands:
  /status                     session status
  /connect                    connect the paired session
  /disconnect                 drop the connection
  /logout                     unpair entirely
  /qr                         pair by scanning a QR code
  /phone <number>             pair with an 8-character code
  /ls [limit]                 list chats
  /msg <jid> [limit]          show messages in a chat
  /send <jid> <text>          send a text message
  /react <jid> <id> <emoji>   react to a message
  /read <jid> <id...>         mark messages read
  /search <query> [limit]     search message history
  /help                       this help
  /quit                       exit";

pub async fn run(service: Arc<MessageService>, cancel: CancellationToken) -> anyhow::Result<()> {
    println!("wabridge — type /help for commands");

    // Background events interrupt the prompt.
    {
        let mut sub = service.subscribe(&[]);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = sub.recv() => {
                        let Some(event) = event else { break };
                        match event.payload {
                            EventPayload::MessageReceived { message } => {
                                let body = if message.text.is_empty() {
                                    format!("[{}]", message.kind.as_str())
                                } else {
                                    message.text.clone()
                                };
                                println!("\r<< {} {}: {body}", message.chat_jid, message.sender_jid.user);
                                prompt();
                            }
                            EventPayload::ConnectionStatus { connected, reason } => {
                                let word = if connected { "connected" } else { "disconnected" };
                                println!("\r== {word} ({reason})");
                                prompt();
                            }
                            _ => {}
                        }
                    }
                }
            }
        });
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    prompt();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            prompt();
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }
        if let Err(e) = dispatch(&service, &cancel, line).await {
            println!("error: {e}");
        }
        prompt();
    }
    Ok(())
}

fn prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn dispatch(
    service: &Arc<MessageService>,
    cancel: &CancellationToken,
    line: &str,
) -> Result<(), BridgeError> {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match command {
        "/help" => println!("{HELP}"),
        "/status" => {
            let status = service.status(cancel).await?;
            println!("state: {:?}", status.state);
            if let Some(jid) = status.jid {
                println!("account: {jid}");
            }
            if let Some(name) = status.push_name {
                println!("name: {name}");
            }
        }
        "/connect" => {
            service.connect(cancel).await?;
            println!("connecting...");
        }
        "/disconnect" => {
            service.disconnect(cancel).await?;
            println!("disconnected");
        }
        "/logout" => {
            service.logout(cancel).await?;
            println!("logged out; /qr or /phone to pair again");
        }
        "/qr" => {
            let mut updates = service.pairing_qr(cancel).await?;
            println!("waiting for QR code... scan with WhatsApp on your phone");
            while let Some(update) = updates.recv().await {
                match update {
                    PairingUpdate::Qr { code } => match wabridge_session::qr::render_terminal(&code)
                    {
                        Ok(block) => println!("{block}"),
                        Err(e) => println!("failed to render QR: {e}"),
                    },
                    PairingUpdate::Success => {
                        println!("paired!");
                        break;
                    }
                    PairingUpdate::Timeout => {
                        println!("pairing timed out");
                        break;
                    }
                    PairingUpdate::Error { message } => {
                        println!("pairing failed: {message}");
                        break;
                    }
                }
            }
        }
        "/phone" => {
            let number = args
                .first()
                .ok_or_else(|| BridgeError::InvalidArgument("usage: /phone <number>".into()))?;
            let code = service.pair_with_code(cancel, number).await?;
            println!("enter this code on your phone: {code}");
        }
        "/ls" => {
            let limit = parse_limit(args.first(), 20)?;
            let chats = service.get_chats(cancel, limit, 0).await?;
            if chats.is_empty() {
                println!("(no chats)");
            }
            for chat in chats {
                let name = if chat.name.is_empty() {
                    chat.jid.to_string()
                } else {
                    chat.name.clone()
                };
                let mut flags = String::new();
                if chat.is_pinned {
                    flags.push('*');
                }
                if chat.is_muted {
                    flags.push('~');
                }
                println!(
                    "{flags}{name} [{}] unread={} — {}",
                    chat.jid, chat.unread_count, chat.last_message_text
                );
            }
        }
        "/msg" => {
            let jid = args
                .first()
                .ok_or_else(|| BridgeError::InvalidArgument("usage: /msg <jid> [limit]".into()))?;
            let limit = parse_limit(args.get(1), 20)?;
            let mut messages = service.get_messages(cancel, jid, limit, 0).await?;
            messages.reverse();
            if messages.is_empty() {
                println!("(no messages)");
            }
            for message in messages {
                let who = if message.is_from_me {
                    "me".to_string()
                } else {
                    message.sender_jid.user.clone()
                };
                let body = if message.text.is_empty() {
                    format!("[{}] {}", message.kind.as_str(), message.caption)
                } else {
                    message.text.clone()
                };
                let read = if message.is_read { " " } else { "*" };
                println!(
                    "{read}[{}] {who}: {body}",
                    message.timestamp.format("%m-%d %H:%M")
                );
            }
        }
        "/send" => {
            if args.len() < 2 {
                return Err(BridgeError::InvalidArgument(
                    "usage: /send <jid> <text>".into(),
                ));
            }
            let text = args[1..].join(" ");
            let message = service.send_text(cancel, args[0], &text).await?;
            println!("sent {} at {}", message.id, message.timestamp.format("%H:%M:%S"));
        }
        "/react" => {
            if args.len() != 3 {
                return Err(BridgeError::InvalidArgument(
                    "usage: /react <jid> <message-id> <emoji>".into(),
                ));
            }
            service
                .send_reaction(cancel, args[0], args[1], args[2])
                .await?;
            println!("reacted {} to {}", args[2], args[1]);
        }
        "/read" => {
            if args.len() < 2 {
                return Err(BridgeError::InvalidArgument(
                    "usage: /read <jid> <message-id...>".into(),
                ));
            }
            let ids: Vec<String> = args[1..].iter().map(|s| s.to_string()).collect();
            let unread = service.mark_read(cancel, args[0], &ids).await?;
            println!("marked {} read, {unread} unread remain", ids.len());
        }
        "/search" => {
            if args.is_empty() {
                return Err(BridgeError::InvalidArgument(
                    "usage: /search <query> [limit]".into(),
                ));
            }
            // A trailing number is the limit; everything before it is query.
            let (query_args, limit) = match args.last().and_then(|s| s.parse::<i64>().ok()) {
                Some(limit) if args.len() > 1 => (&args[..args.len() - 1], limit),
                _ => (&args[..], 20),
            };
            let query = query_args.join(" ");
            let messages = service.search_messages(cancel, &query, limit).await?;
            if messages.is_empty() {
                println!("(no matches)");
            }
            for message in messages {
                println!(
                    "[{}] {} {}: {}",
                    message.timestamp.format("%Y-%m-%d %H:%M"),
                    message.chat_jid,
                    message.id,
                    if message.text.is_empty() {
                        &message.caption
                    } else {
                        &message.text
                    }
                );
            }
        }
        other => {
            println!("unknown command '{other}' — /help for the list");
        }
    }
    Ok(())
}

fn parse_limit(arg: Option<&&str>, default: i64) -> Result<i64, BridgeError> {
    match arg {
        None => Ok(default),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| BridgeError::InvalidArgument(format!("bad limit '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_parse_with_default() {
        assert_eq!(parse_limit(None, 20).unwrap(), 20);
        let raw = "50";
        assert_eq!(parse_limit(Some(&raw), 20).unwrap(), 50);
        let bad = "x";
        assert!(parse_limit(Some(&bad), 20).is_err());
    }

    #[test]
    fn help_covers_every_command() {
        for command in [
            "/status", "/connect", "/disconnect", "/logout", "/qr", "/phone", "/ls", "/msg",
            "/send", "/react", "/read", "/search", "/quit",
        ] {
            assert!(HELP.contains(command), "help missing {command}");
        }
    }
}
