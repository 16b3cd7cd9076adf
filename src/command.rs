//! Command line parsing and dispatch.
//!
//! Commands are a case-insensitive verb followed by an optional argument:
//! - `ECHO <text>`: reply with `<text>`
//! - `TIME`: reply with the server's local time
//! - `UPLOAD <file>` / `DOWNLOAD <file>`: run a file transfer
//! - `CLOSE`, `EXIT`, `QUIT`: reply `BYE` and end the session

use crate::framer::LineFramer;
use crate::transfer::{TransferEngine, TransferError};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// ctime-style layout used for TIME replies.
pub const TIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// A command line split into its verb and the text after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Uppercased first token.
    pub verb: String,
    /// Everything after the verb and one separating whitespace character.
    pub argument: Option<String>,
}

impl CommandLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_start();
        match line.char_indices().find(|(_, c)| c.is_whitespace()) {
            Some((idx, sep)) => CommandLine {
                verb: line[..idx].to_ascii_uppercase(),
                argument: Some(line[idx + sep.len_utf8()..].to_string()),
            },
            None => CommandLine {
                verb: line.to_ascii_uppercase(),
                argument: None,
            },
        }
    }
}

/// Parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Echo(String),
    Time,
    Upload(String),
    Download(String),
    Close,
}

impl Command {
    /// Whether the session ends after this command's reply.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Command::Close)
    }
}

impl TryFrom<CommandLine> for Command {
    type Error = CommandError;

    fn try_from(line: CommandLine) -> Result<Self, Self::Error> {
        match line.verb.as_str() {
            "ECHO" => Ok(Command::Echo(line.argument.unwrap_or_default())),
            "TIME" => Ok(Command::Time),
            "UPLOAD" => filename(&line).map(Command::Upload),
            "DOWNLOAD" => filename(&line).map(Command::Download),
            "CLOSE" | "EXIT" | "QUIT" => Ok(Command::Close),
            _ => Err(CommandError::UnknownCommand(line.verb)),
        }
    }
}

fn filename(line: &CommandLine) -> Result<String, CommandError> {
    match line.argument.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(CommandError::MissingFilename(line.verb.clone())),
    }
}

/// Protocol errors reported back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Verb is not one we know
    UnknownCommand(String),
    /// UPLOAD or DOWNLOAD without a filename
    MissingFilename(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::UnknownCommand(verb) => write!(f, "unknown command: {}", verb),
            CommandError::MissingFilename(verb) => write!(f, "missing filename for {}", verb),
        }
    }
}

impl std::error::Error for CommandError {}

/// Reply line plus whether the connection should close after sending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub close: bool,
}

impl Reply {
    fn line(text: impl Into<String>) -> Self {
        Reply {
            text: text.into(),
            close: false,
        }
    }

    fn error(err: impl std::fmt::Display) -> Self {
        Reply::line(format!("ERROR {}", err))
    }
}

/// Maps command lines to replies, running transfers along the way.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    engine: TransferEngine,
}

impl Dispatcher {
    pub fn new(engine: TransferEngine) -> Self {
        Self { engine }
    }

    /// Produce the reply for one command line.
    ///
    /// Protocol, file and partial-transfer errors become `ERROR` replies.
    /// Only socket failures are returned as `Err`, since nothing more can be
    /// sent on that connection.
    pub async fn dispatch<R, W>(
        &self,
        line: &str,
        framer: &mut LineFramer<R>,
        writer: &mut W,
    ) -> io::Result<Reply>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let command = match Command::try_from(CommandLine::parse(line)) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, "Rejected command");
                return Ok(Reply::error(e));
            }
        };

        let result = match &command {
            Command::Echo(text) => return Ok(Reply::line(text.as_str())),
            Command::Time => return Ok(Reply::line(current_time())),
            Command::Close => {
                return Ok(Reply {
                    text: "BYE".to_string(),
                    close: command.is_terminal(),
                })
            }
            Command::Upload(name) => self.engine.receive(name, framer, writer).await,
            Command::Download(name) => self.engine.send(name, writer).await,
        };

        match result {
            Ok(report) => Ok(Reply::line(report.status_line())),
            Err(TransferError::Socket(e)) => Err(e),
            Err(e) if e.is_connection_fault() => {
                warn!(error = %e, "Transfer aborted");
                Err(io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
            }
            Err(e) => {
                debug!(error = %e, "Transfer failed");
                Ok(Reply::error(e))
            }
        }
    }
}

/// Local time in ctime layout, e.g. `Sat Oct 17 09:05:01 2026`.
pub fn current_time() -> String {
    chrono::Local::now().format(TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use tokio_test::io::Builder;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(TransferEngine::new(std::env::temp_dir(), 1024))
    }

    async fn reply_to(line: &str) -> Reply {
        let mut framer = LineFramer::new(Builder::new().build());
        let mut writer = Builder::new().build();
        dispatcher()
            .dispatch(line, &mut framer, &mut writer)
            .await
            .unwrap()
    }

    #[test]
    fn test_parse_command_line() {
        let line = CommandLine::parse("upload report.txt");
        assert_eq!(line.verb, "UPLOAD");
        assert_eq!(line.argument.as_deref(), Some("report.txt"));

        let line = CommandLine::parse("time");
        assert_eq!(line.verb, "TIME");
        assert_eq!(line.argument, None);
    }

    #[test]
    fn test_echo_keeps_inner_spacing() {
        let cmd = Command::try_from(CommandLine::parse("ECHO  two  spaces")).unwrap();
        assert_eq!(cmd, Command::Echo(" two  spaces".to_string()));
    }

    #[test]
    fn test_close_verbs_case_insensitive() {
        for verb in ["close", "EXIT", "Quit"] {
            let cmd = Command::try_from(CommandLine::parse(verb)).unwrap();
            assert!(cmd.is_terminal());
        }
    }

    #[test]
    fn test_missing_filename() {
        let err = Command::try_from(CommandLine::parse("DOWNLOAD   ")).unwrap_err();
        assert_eq!(err, CommandError::MissingFilename("DOWNLOAD".to_string()));
        assert_eq!(err.to_string(), "missing filename for DOWNLOAD");
    }

    #[test]
    fn test_unknown_verb() {
        let err = Command::try_from(CommandLine::parse("ECHOX hi")).unwrap_err();
        assert_eq!(err, CommandError::UnknownCommand("ECHOX".to_string()));
    }

    #[tokio::test]
    async fn test_dispatch_echo() {
        let reply = reply_to("ECHO hello").await;
        assert_eq!(reply.text, "hello");
        assert!(!reply.close);
    }

    #[tokio::test]
    async fn test_dispatch_time_parses() {
        let reply = reply_to("TIME").await;
        // %e space-pads single-digit days
        let normalized = reply.text.split_whitespace().collect::<Vec<_>>().join(" ");
        assert!(NaiveDateTime::parse_from_str(&normalized, "%a %b %d %H:%M:%S %Y").is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_close() {
        let reply = reply_to("quit").await;
        assert_eq!(reply.text, "BYE");
        assert!(reply.close);
    }

    #[tokio::test]
    async fn test_dispatch_errors_stay_inline() {
        let reply = reply_to("UPLOAD").await;
        assert_eq!(reply.text, "ERROR missing filename for UPLOAD");
        assert!(!reply.close);

        let reply = reply_to("FETCH thing").await;
        assert_eq!(reply.text, "ERROR unknown command: FETCH");
    }

    #[tokio::test]
    async fn test_dispatch_download_not_found() {
        let reply = reply_to("DOWNLOAD filecast-definitely-missing.bin").await;
        assert_eq!(
            reply.text,
            "ERROR file not found: filecast-definitely-missing.bin"
        );
    }
}
