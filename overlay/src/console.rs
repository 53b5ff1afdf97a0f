//! Reads interactive commands line by line and runs them against a registry
//! or an overlay node.

use crate::applications::{NodeState, OverlayNode, Registry};
use std::{io, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error as ThisError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub const REGISTRY_USAGE: &str = "Please enter a command for the registry to execute \
    (list-messaging-nodes, setup-overlay [number-of-routing-table-entries], \
    list-routing-tables, start <number-of-messages>, CTRL-D to exit)";

pub const NODE_USAGE: &str = "Please enter a command for the node to execute \
    (print-counters-and-diagnostics, exit-overlay, CTRL-D to exit)";

/// How long `exit-overlay` waits for the registry to confirm.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryCommand {
    ListMessagingNodes,
    /// Uses the configured default size when none is given
    SetupOverlay(Option<usize>),
    ListRoutingTables,
    Start(u32),
}

impl FromStr for RegistryCommand {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let command = words.next().ok_or(ParseCommandError::Empty)?;
        let argument = words.next();
        if words.next().is_some() {
            Err(ParseCommandError::TooManyArguments(command.into()))?
        }

        match (command, argument) {
            ("list-messaging-nodes", None) => Ok(RegistryCommand::ListMessagingNodes),
            ("list-routing-tables", None) => Ok(RegistryCommand::ListRoutingTables),
            ("setup-overlay", None) => Ok(RegistryCommand::SetupOverlay(None)),
            ("setup-overlay", Some(size)) => Ok(RegistryCommand::SetupOverlay(Some(
                parse_number(command, size)?,
            ))),
            ("start", Some(count)) => Ok(RegistryCommand::Start(parse_number(command, count)?)),
            ("start", None) => Err(ParseCommandError::MissingArgument(command.into())),
            ("list-messaging-nodes" | "list-routing-tables", Some(_)) => {
                Err(ParseCommandError::TooManyArguments(command.into()))
            }
            _ => Err(ParseCommandError::Unknown(command.into())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    PrintCountersAndDiagnostics,
    ExitOverlay,
}

impl FromStr for NodeCommand {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let command = words.next().ok_or(ParseCommandError::Empty)?;
        if words.next().is_some() {
            Err(ParseCommandError::TooManyArguments(command.into()))?
        }
        match command {
            "print-counters-and-diagnostics" => Ok(NodeCommand::PrintCountersAndDiagnostics),
            "exit-overlay" => Ok(NodeCommand::ExitOverlay),
            _ => Err(ParseCommandError::Unknown(command.into())),
        }
    }
}

fn parse_number<T: FromStr>(command: &str, value: &str) -> Result<T, ParseCommandError> {
    value
        .parse()
        .map_err(|_| ParseCommandError::InvalidArgument {
            command: command.into(),
            value: value.into(),
        })
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ParseCommandError {
    #[error("No command given")]
    Empty,
    #[error("Unknown command {0:?}")]
    Unknown(String),
    #[error("{0} needs an argument")]
    MissingArgument(String),
    #[error("{command} expects a non-negative number, not {value:?}")]
    InvalidArgument { command: String, value: String },
    #[error("Too many arguments for {0}")]
    TooManyArguments(String),
}

/// Runs one registry command and renders its outcome.
pub fn execute_registry_command(registry: &Registry, command: RegistryCommand) -> String {
    match command {
        RegistryCommand::ListMessagingNodes => registry.list_messaging_nodes(),
        RegistryCommand::ListRoutingTables => registry.list_routing_tables(),
        RegistryCommand::SetupOverlay(size) => match registry.setup_overlay(size) {
            Ok(nodes) => format!("Sent routing tables to {nodes} nodes"),
            Err(e) => e.to_string(),
        },
        RegistryCommand::Start(count) => match registry.start(count) {
            Ok(nodes) => format!("Told {nodes} nodes to send {count} packets each"),
            Err(e) => e.to_string(),
        },
    }
}

/// Reads registry commands until `input` ends.
pub async fn run_registry_console(
    registry: Arc<Registry>,
    input: impl AsyncBufRead + Unpin,
) -> io::Result<()> {
    println!("{REGISTRY_USAGE}");
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match line.parse::<RegistryCommand>() {
            Ok(command) => println!("{}", execute_registry_command(&registry, command)),
            Err(ParseCommandError::Empty) => {}
            Err(e) => println!("{e}\n{REGISTRY_USAGE}"),
        }
    }
    Ok(())
}

/// Reads node commands until `input` ends or the node leaves the overlay.
pub async fn run_node_console(
    node: Arc<OverlayNode>,
    input: impl AsyncBufRead + Unpin,
) -> io::Result<()> {
    println!("{NODE_USAGE}");
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match line.parse::<NodeCommand>() {
            Ok(NodeCommand::PrintCountersAndDiagnostics) => println!("{}", node.diagnostics()),
            Ok(NodeCommand::ExitOverlay) => {
                if let Err(e) = node.exit_overlay() {
                    println!("{e}");
                    continue;
                }
                if wait_until_unregistered(&node).await {
                    println!("Left the overlay");
                    return Ok(());
                }
                println!("The registry did not confirm the deregistration");
            }
            Err(ParseCommandError::Empty) => {}
            Err(e) => println!("{e}\n{NODE_USAGE}"),
        }
    }
    Ok(())
}

async fn wait_until_unregistered(node: &OverlayNode) -> bool {
    let mut state = node.subscribe_state();
    let unregistered = async {
        while *state.borrow_and_update() != NodeState::Unregistered {
            if state.changed().await.is_err() {
                return false;
            }
        }
        true
    };
    tokio::time::timeout(EXIT_TIMEOUT, unregistered)
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn parses_registry_commands() {
        assert_eq!(
            "list-messaging-nodes".parse::<RegistryCommand>(),
            Ok(RegistryCommand::ListMessagingNodes)
        );
        assert_eq!(
            "  setup-overlay  ".parse::<RegistryCommand>(),
            Ok(RegistryCommand::SetupOverlay(None))
        );
        assert_eq!(
            "setup-overlay 4".parse::<RegistryCommand>(),
            Ok(RegistryCommand::SetupOverlay(Some(4)))
        );
        assert_eq!("start 25".parse::<RegistryCommand>(), Ok(RegistryCommand::Start(25)));
        assert_eq!(
            "start".parse::<RegistryCommand>(),
            Err(ParseCommandError::MissingArgument("start".into()))
        );
        assert_eq!(
            "start -3".parse::<RegistryCommand>(),
            Err(ParseCommandError::InvalidArgument {
                command: "start".into(),
                value: "-3".into()
            })
        );
        assert_eq!(
            "list-routing-tables now".parse::<RegistryCommand>(),
            Err(ParseCommandError::TooManyArguments("list-routing-tables".into()))
        );
        assert_eq!(
            "exit-overlay".parse::<RegistryCommand>(),
            Err(ParseCommandError::Unknown("exit-overlay".into()))
        );
        assert_eq!("".parse::<RegistryCommand>(), Err(ParseCommandError::Empty));
    }

    #[test]
    #[ntest::timeout(100)]
    fn parses_node_commands() {
        assert_eq!(
            "print-counters-and-diagnostics".parse::<NodeCommand>(),
            Ok(NodeCommand::PrintCountersAndDiagnostics)
        );
        assert_eq!("exit-overlay\n".parse::<NodeCommand>(), Ok(NodeCommand::ExitOverlay));
        assert_eq!(
            "start 5".parse::<NodeCommand>(),
            Err(ParseCommandError::TooManyArguments("start".into()))
        );
    }
}
