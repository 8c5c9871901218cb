//! Line commands understood by the interactive prompt.

use thiserror::Error;

pub const HELP: &str = "\
/send <receiver_id> <receiver_address> <text>   send a message
/open <address>                                 listen for messages from address
/close <address>                                stop listening
/list                                           conversations as JSON
/read <message_id>|all                          mark messages read
/notifications                                  unseen notifications as JSON
/user <user_id>                                 last known details of a user
/status                                         session state
/connect                                        retry a failed network bootstrap
/quit                                           leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send {
        receiver_id: String,
        receiver_address: String,
        content: String,
    },
    Open(String),
    Close(String),
    List,
    ReadOne(String),
    ReadAll,
    Notifications,
    User(String),
    Status,
    Connect,
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("Empty input")]
    Empty,

    #[error("Unknown command: {0} (try /help)")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }

        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        match name {
            "/send" => {
                let mut parts = rest.splitn(3, char::is_whitespace);
                let receiver_id = parts.next().filter(|s| !s.is_empty());
                let receiver_address = parts.next().filter(|s| !s.is_empty());
                let content = parts.next().map(str::trim).filter(|s| !s.is_empty());
                match (receiver_id, receiver_address, content) {
                    (Some(id), Some(address), Some(content)) => Ok(Command::Send {
                        receiver_id: id.to_string(),
                        receiver_address: address.to_string(),
                        content: content.to_string(),
                    }),
                    _ => Err(CommandError::Usage("/send <receiver_id> <receiver_address> <text>")),
                }
            }
            "/open" => single_arg(rest, "/open <address>").map(Command::Open),
            "/close" => single_arg(rest, "/close <address>").map(Command::Close),
            "/read" => match single_arg(rest, "/read <message_id>|all")? {
                arg if arg.eq_ignore_ascii_case("all") => Ok(Command::ReadAll),
                arg => Ok(Command::ReadOne(arg)),
            },
            "/list" => Ok(Command::List),
            "/notifications" => Ok(Command::Notifications),
            "/user" => single_arg(rest, "/user <user_id>").map(Command::User),
            "/status" => Ok(Command::Status),
            "/connect" | "/retry" => Ok(Command::Connect),
            "/help" => Ok(Command::Help),
            "/quit" | "/exit" => Ok(Command::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn single_arg(rest: &str, usage: &'static str) -> Result<String, CommandError> {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(arg), None) => Ok(arg.to_string()),
        _ => Err(CommandError::Usage(usage)),
    }
}
