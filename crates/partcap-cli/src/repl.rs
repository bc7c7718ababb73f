//! REPL – interactive capability shell.
//!
//! Supported slash-commands:
//!   /help                – show this list
//!   /props               – list every cap-* property with its current value
//!   /get <name>          – show one property
//!   /set <name> <value>  – change a property (before /apply only)
//!   /apply               – start the machine and validate every capability
//!   /save                – emit the outgoing migration record as JSON
//!   /load [json]         – run an incoming migration against this machine
//!   /quit | /exit        – leave the shell

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use partcap_kernel::accessor::properties;
use partcap_kernel::{Machine, MachineState, MigrationRecord};

use crate::config::MachineConfig;

/// Result of one shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Lines to print.
    Output(Vec<String>),
    Quit,
}

impl Reply {
    fn line(s: impl Into<String>) -> Self {
        Reply::Output(vec![s.into()])
    }
}

/// Shell state: the machine under configuration and the last saved record.
pub struct Shell {
    machine: Machine,
    last_record: Option<MigrationRecord>,
}

impl Shell {
    pub fn new(cfg: &MachineConfig) -> Result<Self, String> {
        Ok(Self {
            machine: cfg.build()?,
            last_record: None,
        })
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Execute one command line.
    pub fn execute(&mut self, line: &str) -> Result<Reply, String> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(Reply::Output(Vec::new()));
        };
        let args: Vec<&str> = parts.collect();

        match (cmd, args.as_slice()) {
            ("/help", _) => Ok(Reply::Output(help_lines())),
            ("/props", _) => Ok(self.cmd_props()),
            ("/get", [name]) => self
                .machine
                .get_property(name)
                .map(|v| Reply::line(format!("{name} = {v}")))
                .map_err(|e| e.to_string()),
            ("/set", [name, value]) => self
                .machine
                .set_property(name, value)
                .map(|()| Reply::line(format!("{name} set")))
                .map_err(|e| e.to_string()),
            ("/apply", []) => self.cmd_apply(),
            ("/save", []) => self.cmd_save(),
            ("/load", rest) => self.cmd_load(&rest.join(" ")),
            ("/quit" | "/exit", _) => Ok(Reply::Quit),
            ("/get" | "/set" | "/apply" | "/save", _) => {
                Err(format!("wrong arguments for {cmd}, see /help"))
            }
            (other, _) => Err(format!(
                "Unknown command: '{other}'. Type /help for available commands."
            )),
        }
    }

    fn cmd_props(&self) -> Reply {
        let lines = properties()
            .into_iter()
            .map(|p| {
                let value = self
                    .machine
                    .get_property(&p.name)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|e| format!("<{e}>"));
                format!("{:<24} {:<6} {:<8} {}", p.name, p.type_name, value, p.description)
            })
            .collect();
        Reply::Output(lines)
    }

    fn cmd_apply(&mut self) -> Result<Reply, String> {
        self.machine.start().map_err(|e| e.to_string())?;
        Ok(Reply::line(format!(
            "machine running with {} unit(s)",
            self.machine.units().len()
        )))
    }

    fn cmd_save(&mut self) -> Result<Reply, String> {
        if self.machine.state() != MachineState::Running {
            return Err("machine is not running, use /apply first".into());
        }
        let record = self.machine.pre_save();
        let json = serde_json::to_string(&record).map_err(|e| e.to_string())?;
        self.last_record = Some(record);
        Ok(Reply::line(json))
    }

    fn cmd_load(&mut self, json: &str) -> Result<Reply, String> {
        let record = if json.is_empty() {
            self.last_record
                .clone()
                .ok_or("no saved record, use /save or pass one as JSON")?
        } else {
            serde_json::from_str::<MigrationRecord>(json)
                .map_err(|e| format!("invalid record: {e}"))?
        };

        self.machine.pre_load();
        self.machine.load_record(&record).map_err(|e| e.to_string())?;
        let report = self.machine.post_load().map_err(|e| e.to_string())?;

        let mut lines = vec!["incoming migration accepted".to_string()];
        lines.extend(report.warnings.iter().map(|w| format!("warning: {w}")));
        Ok(Reply::Output(lines))
    }
}

fn help_lines() -> Vec<String> {
    [
        ("/props", "list capability properties"),
        ("/get <name>", "show one property"),
        ("/set <name> <value>", "change a property before /apply"),
        ("/apply", "start the machine"),
        ("/save", "emit the outgoing migration record"),
        ("/load [json]", "check an incoming migration record"),
        ("/quit  /exit", "exit the shell"),
    ]
    .iter()
    .map(|(cmd, what)| format!("  {cmd:<20} – {what}"))
    .collect()
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(mut shell: Shell, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "partcap>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }

        match shell.execute(cmd) {
            Ok(Reply::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(Reply::Output(lines)) => {
                for l in lines {
                    println!("{l}");
                }
            }
            Err(e) => println!("{} {}", "Error:".red(), e),
        }

        if shell.machine().state() == MachineState::Terminated {
            println!(
                "{}",
                "Machine terminated. Fix the configuration and restart."
                    .red()
                    .bold()
            );
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigValue;

    fn shell() -> Shell {
        let mut cfg = MachineConfig::default();
        cfg.caps.insert("htm".into(), ConfigValue::Bool(false));
        Shell::new(&cfg).expect("shell")
    }

    fn output(reply: Reply) -> Vec<String> {
        match reply {
            Reply::Output(lines) => lines,
            Reply::Quit => panic!("unexpected quit"),
        }
    }

    #[test]
    fn props_lists_every_capability() {
        let lines = output(shell().execute("/props").unwrap());
        assert_eq!(lines.len(), partcap_types::NUM_CAPS);
        assert!(lines[0].starts_with("cap-htm"));
        assert!(lines[6].contains("64K"));
    }

    #[test]
    fn set_then_get() {
        let mut sh = shell();
        sh.execute("/set cap-cfpc WORKAROUND").unwrap();
        let lines = output(sh.execute("/get cap-cfpc").unwrap());
        assert_eq!(lines, ["cap-cfpc = workaround"]);
    }

    #[test]
    fn help_query_is_returned_as_error() {
        let err = shell().execute("/set cap-ibs ?").unwrap_err();
        assert!(err.starts_with("broken - no protection"), "{err}");
    }

    #[test]
    fn apply_then_set_is_refused() {
        let mut sh = shell();
        sh.execute("/apply").unwrap();
        assert!(sh.execute("/set cap-htm on").is_err());
    }

    #[test]
    fn fatal_apply_terminates() {
        let mut sh = shell();
        sh.execute("/set cap-htm on").unwrap();
        let err = sh.execute("/apply").unwrap_err();
        assert!(err.starts_with("cap-htm:"), "{err}");
        assert_eq!(sh.machine().state(), MachineState::Terminated);
    }

    #[test]
    fn save_then_load_round_trip() {
        let mut sh = shell();
        assert!(sh.execute("/save").is_err());
        sh.execute("/apply").unwrap();
        let saved = output(sh.execute("/save").unwrap());
        // htm is off here but on by default for power9.
        assert_eq!(saved, [r#"{"htm":0}"#]);
        let lines = output(sh.execute("/load").unwrap());
        assert_eq!(lines, ["incoming migration accepted"]);
    }

    #[test]
    fn load_rejects_stronger_source() {
        let mut sh = shell();
        sh.execute("/apply").unwrap();
        let err = sh.execute(r#"/load {"htm": 0, "sbbc": 2}"#).unwrap_err();
        assert!(err.contains("cap-sbbc higher level (2)"), "{err}");
        // The destination keeps running.
        assert_eq!(sh.machine().state(), MachineState::Running);
    }

    #[test]
    fn unknown_command_and_quit() {
        let mut sh = shell();
        assert!(sh.execute("/warp").is_err());
        assert!(sh.execute("/get").is_err());
        assert_eq!(sh.execute("/quit").unwrap(), Reply::Quit);
    }
}
