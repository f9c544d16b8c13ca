//! Console system.
//!
//! A command registry for the server's operator surface: the server core
//! registers `status` and `clients`, the Koinonia plug-in registers its
//! object-management commands, and `help` lists whatever was registered.
//! Shared object and namespace names may contain spaces, so argument
//! splitting understands double quotes.
//!
//! # Usage
//! ```ignore
//! let mut console = Console::new();
//! console.register_command("status", "Show server status", |args, out| {
//!     out.print("ok");
//!     Ok(())
//! });
//! console.exec("status")?;
//! ```

use std::collections::HashMap;

use anyhow::Context;

/// Command handler function type.
pub type CommandHandler = Box<dyn Fn(&[&str], &mut ConsoleOutput) -> anyhow::Result<()> + Send>;

/// Output collector passed to command handlers.
#[derive(Default)]
pub struct ConsoleOutput {
    lines: Vec<String>,
}

impl ConsoleOutput {
    pub fn print(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

struct Command {
    help: String,
    handler: CommandHandler,
}

/// The console.
pub struct Console {
    commands: HashMap<String, Command>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Registers a command with a one-line help text.
    pub fn register_command<F>(&mut self, name: &str, help: &str, handler: F)
    where
        F: Fn(&[&str], &mut ConsoleOutput) -> anyhow::Result<()> + Send + 'static,
    {
        self.commands.insert(
            name.to_string(),
            Command {
                help: help.to_string(),
                handler: Box::new(handler),
            },
        );
    }

    /// Executes a console command line; returns the produced output lines.
    pub fn exec(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let arguments = split_arguments(line);
        let Some((name, args)) = arguments.split_first() else {
            return Ok(Vec::new());
        };
        let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

        let mut out = ConsoleOutput::default();
        if name == "help" {
            let mut names: Vec<&String> = self.commands.keys().collect();
            names.sort();
            for name in names {
                out.print(format!("  {} - {}", name, self.commands[name].help));
            }
        } else if let Some(command) = self.commands.get(name.as_str()) {
            (command.handler)(&args, &mut out).with_context(|| format!("command '{name}'"))?;
        } else {
            out.print(format!("Unknown command: {name}"));
        }
        Ok(out.lines)
    }
}

/// Splits a command line into arguments. A double-quoted argument keeps
/// its spaces (shared object and namespace names may contain them); an
/// unterminated quote runs to the end of the line.
pub fn split_arguments(line: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    let mut rest = line.trim_start();
    while !rest.is_empty() {
        let argument = if let Some(quoted) = rest.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((inner, tail)) => {
                    rest = tail;
                    inner.to_string()
                }
                None => {
                    rest = "";
                    quoted.to_string()
                }
            }
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let (argument, tail) = rest.split_at(end);
            rest = tail;
            argument.to_string()
        };
        arguments.push(argument);
        rest = rest.trim_start();
    }
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_dispatches_to_registered_command() {
        let mut console = Console::new();
        console.register_command("double", "Doubles a number", |args, out| {
            let n: i64 = args[0].parse()?;
            out.print(format!("{}", n * 2));
            Ok(())
        });

        assert_eq!(console.exec("double 21").unwrap(), vec!["42"]);
    }

    #[test]
    fn unknown_command_reports_not_fails() {
        let mut console = Console::new();
        let out = console.exec("frobnicate").unwrap();
        assert_eq!(out, vec!["Unknown command: frobnicate"]);
    }

    #[test]
    fn help_lists_registered_commands() {
        let mut console = Console::new();
        console.register_command("status", "Show server status", |_, _| Ok(()));
        console.register_command("clients", "List connected clients", |_, _| Ok(()));

        let out = console.exec("help").unwrap();
        assert_eq!(
            out,
            vec![
                "  clients - List connected clients",
                "  status - Show server status",
            ]
        );
    }

    #[test]
    fn quoted_names_keep_their_spaces() {
        assert_eq!(
            split_arguments(r#"koinonia save "avatar config" state/avatars.dump"#),
            vec!["koinonia", "save", "avatar config", "state/avatars.dump"]
        );
        assert_eq!(
            split_arguments(r#"koinonia print "shared whiteboard""#),
            vec!["koinonia", "print", "shared whiteboard"]
        );
    }

    #[test]
    fn unterminated_quote_runs_to_end_of_line() {
        assert_eq!(
            split_arguments(r#"koinonia delete "half open"#),
            vec!["koinonia", "delete", "half open"]
        );
    }

    #[test]
    fn blank_and_whitespace_lines_produce_nothing() {
        assert!(split_arguments("").is_empty());
        assert!(split_arguments("   \t ").is_empty());
        let mut console = Console::new();
        assert!(console.exec("   ").unwrap().is_empty());
    }
}
