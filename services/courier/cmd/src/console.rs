//! Line-oriented operator console on stdin.

use anyhow::{anyhow, bail, Context, Result};
use courier_session::{
    parse_interval, parse_messages, CampaignRequest, LoginReply, SessionId, SessionService,
};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

const HELP: &str = "\
Commands:
  login <phone-number>                                    create a session and pair it
  campaign <session-id> <target> <messages-file> [interval-secs] [label...]
                                                          start dispatching a message file
  groups <session-id>                                     list groups of a connected session
  stop <session-id>                                       log out and forget a session
  list                                                    show every session
  help                                                    show this help
  quit                                                    shut down";

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login(String),
    Campaign {
        session_id: SessionId,
        target: String,
        messages_file: PathBuf,
        interval_seconds: Option<u64>,
        label: String,
    },
    Groups(SessionId),
    Stop(SessionId),
    List,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line; `Ok(None)` for a blank line
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "login" => {
                let phone_number = words.collect::<Vec<_>>().join(" ");
                if phone_number.is_empty() {
                    bail!("missing phone number (try `help`)");
                }
                Command::Login(phone_number)
            }
            "campaign" => {
                let session_id = SessionId::from(required(&mut words, "session id")?);
                let target = required(&mut words, "target")?;
                let messages_file = PathBuf::from(required(&mut words, "messages file")?);
                let interval_seconds = words.next().map(parse_interval);
                let label = words.collect::<Vec<_>>().join(" ");
                Command::Campaign {
                    session_id,
                    target,
                    messages_file,
                    interval_seconds,
                    label,
                }
            }
            "groups" => Command::Groups(SessionId::from(required(&mut words, "session id")?)),
            "stop" => Command::Stop(SessionId::from(required(&mut words, "session id")?)),
            "list" | "ls" => Command::List,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command {:?} (try `help`)", other),
        };
        Ok(Some(command))
    }
}

fn required<'a>(words: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<String> {
    words
        .next()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing {} (try `help`)", what))
}

/// Executes console commands against the session service
#[derive(Clone)]
pub struct Console {
    service: Arc<SessionService>,
    default_interval: u64,
}

impl Console {
    pub fn new(service: Arc<SessionService>, default_interval: u64) -> Self {
        Self {
            service,
            default_interval,
        }
    }

    /// Run a command and render its result for the operator
    pub async fn execute(&self, command: Command) -> Result<String> {
        match command {
            Command::Login(phone_number) => {
                let outcome = self.service.login(&phone_number).await?;
                Ok(match outcome.reply {
                    LoginReply::PairingCode(code) => format!(
                        "Session {}: enter pairing code {} on the device",
                        outcome.session_id, code
                    ),
                    LoginReply::Connected => format!("Session {}: connected", outcome.session_id),
                })
            }
            Command::Campaign {
                session_id,
                target,
                messages_file,
                interval_seconds,
                label,
            } => {
                let text = tokio::fs::read_to_string(&messages_file)
                    .await
                    .with_context(|| format!("reading messages from {:?}", messages_file))?;
                let messages = parse_messages(&text);
                let count = messages.len();
                let interval_seconds = match interval_seconds {
                    Some(secs) if secs > 0 => secs,
                    _ => self.default_interval,
                };
                self.service
                    .start_campaign(
                        &session_id,
                        CampaignRequest {
                            target,
                            label,
                            messages,
                            interval_seconds,
                        },
                    )
                    .await?;
                Ok(format!(
                    "Session {}: dispatching {} messages every {}s",
                    session_id, count, interval_seconds
                ))
            }
            Command::Groups(session_id) => {
                let groups = self.service.list_groups(&session_id).await?;
                if groups.is_empty() {
                    return Ok(format!("Session {}: no groups", session_id));
                }
                let mut out = String::new();
                for group in groups {
                    let _ = writeln!(out, "{:<40} {}", group.id, group.name);
                }
                Ok(out.trim_end().to_string())
            }
            Command::Stop(session_id) => {
                self.service.stop(&session_id).await?;
                Ok(format!("Session {}: stopped and logged out", session_id))
            }
            Command::List => {
                let sessions = self.service.sessions().await;
                if sessions.is_empty() {
                    return Ok("No sessions".to_string());
                }
                let mut out = String::new();
                for session in sessions {
                    let campaign = match &session.campaign {
                        Some(c) => format!(
                            "{} [{}/{}]",
                            c.target,
                            c.clamped_cursor() + 1,
                            c.messages.len()
                        ),
                        None => "-".to_string(),
                    };
                    let _ = writeln!(
                        out,
                        "{} {:<16} {:<13} retries={:<3} {}",
                        session.id, session.phone_number, session.state, session.reconnect_attempts, campaign
                    );
                }
                Ok(out.trim_end().to_string())
            }
            Command::Help => Ok(HELP.to_string()),
            Command::Quit => Ok("Shutting down".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_session::{LoopbackOptions, LoopbackTransport, ServiceConfig};
    use courier_storage::Storage;
    use std::io::Write;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(
            Command::parse("login +49 151").unwrap(),
            Some(Command::Login("+49 151".to_string()))
        );
        assert_eq!(
            Command::parse("campaign abc 1203@g.us msgs.txt 10 Hello there").unwrap(),
            Some(Command::Campaign {
                session_id: SessionId::from("abc"),
                target: "1203@g.us".to_string(),
                messages_file: PathBuf::from("msgs.txt"),
                interval_seconds: Some(10),
                label: "Hello there".to_string(),
            })
        );
        assert_eq!(Command::parse("LIST").unwrap(), Some(Command::List));
        assert!(Command::parse("stop").is_err());
        assert!(Command::parse("login").is_err());
        assert!(Command::parse("launch").is_err());
    }

    fn console() -> Console {
        let transport = Arc::new(LoopbackTransport::new(LoopbackOptions {
            assume_registered: true,
            ..LoopbackOptions::automatic()
        }));
        let service = SessionService::new(Storage::in_memory(), transport, ServiceConfig::default());
        Console::new(Arc::new(service), 5)
    }

    #[tokio::test]
    async fn test_login_campaign_and_stop() {
        let console = console();
        let reply = console
            .execute(Command::Login("15550001111".to_string()))
            .await
            .unwrap();
        assert!(reply.ends_with("connected"), "{}", reply);

        let sessions = console.service.sessions().await;
        let id = sessions[0].id.clone();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "first\n\n second ").unwrap();
        let reply = console
            .execute(Command::Campaign {
                session_id: id.clone(),
                target: "15550002222".to_string(),
                messages_file: file.path().to_path_buf(),
                interval_seconds: None,
                label: "Hi".to_string(),
            })
            .await
            .unwrap();
        assert!(reply.contains("2 messages every 5s"), "{}", reply);

        let listing = console.execute(Command::List).await.unwrap();
        assert!(listing.contains("CONNECTED"), "{}", listing);

        console.execute(Command::Stop(id.clone())).await.unwrap();
        assert!(console.execute(Command::Stop(id)).await.is_err());
        assert_eq!(console.execute(Command::List).await.unwrap(), "No sessions");
    }
}
