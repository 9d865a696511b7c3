//! Line-oriented console standing in for the app UI: commands from stdin, observer output
//! to stdout.

use std::str::FromStr;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::actor::HostEvent;

pub const HELP: &str = "commands: send <text> | ask <text> | pull-logs [secs] | start-session | \
                        fail-session | status | deactivate | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    /// Fire-and-forget relay.
    Send(String),
    /// Relay that waits for the peer's acknowledgment.
    Ask(String),
    PullLogs(Option<u64>),
    StartSession,
    /// Report a failure of the current external session, as the framework would.
    FailSession,
    Status,
    Deactivate,
    Help,
    Quit,
}

impl FromStr for UiCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        let text = |name: &str| {
            if rest.is_empty() {
                Err(format!("{} needs some text", name))
            } else {
                Ok(rest.to_string())
            }
        };
        match word {
            "send" => text("send").map(UiCommand::Send),
            "ask" => text("ask").map(UiCommand::Ask),
            "pull-logs" if rest.is_empty() => Ok(UiCommand::PullLogs(None)),
            "pull-logs" => rest
                .parse()
                .map(|secs| UiCommand::PullLogs(Some(secs)))
                .map_err(|_| format!("bad deadline `{}`", rest)),
            "start-session" => Ok(UiCommand::StartSession),
            "fail-session" => Ok(UiCommand::FailSession),
            "status" => Ok(UiCommand::Status),
            "deactivate" => Ok(UiCommand::Deactivate),
            "help" | "?" => Ok(UiCommand::Help),
            "quit" | "exit" => Ok(UiCommand::Quit),
            other => Err(format!("unknown command `{}`", other)),
        }
    }
}

/// Read commands from stdin until EOF. Parse errors go straight to the printer.
pub async fn read_stdin(events: mpsc::UnboundedSender<HostEvent>, ui: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<UiCommand>() {
            Ok(cmd) => {
                if events.send(HostEvent::Input(cmd)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = ui.send(format!("{} ({})", e, HELP));
            }
        }
    }
    debug!("stdin closed");
}

/// Observer: prints everything the actor sends to the UI channel.
pub async fn print_loop(mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<UiCommand, String> {
        line.parse()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse("send action button"),
            Ok(UiCommand::Send("action button".into()))
        );
        assert_eq!(parse("  ask  hi there "), Ok(UiCommand::Ask("hi there".into())));
        assert_eq!(parse("pull-logs"), Ok(UiCommand::PullLogs(None)));
        assert_eq!(parse("pull-logs 5"), Ok(UiCommand::PullLogs(Some(5))));
        assert_eq!(parse("start-session"), Ok(UiCommand::StartSession));
        assert_eq!(parse("quit"), Ok(UiCommand::Quit));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("send").is_err());
        assert!(parse("pull-logs soon").is_err());
        assert!(parse("reboot").is_err());
    }
}
