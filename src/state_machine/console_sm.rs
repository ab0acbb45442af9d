//! Console state machine.
//!
//! Models the interactive console:
//! ```text
//! Ready ──stop (VM running)──► ConfirmingTerminate
//!   ▲                                  │ y / n
//!   └──────────────────────────────────┘
//! ```
//!
//! The supervisor, settings and output buffer are passed in as the
//! [`Session`] context, so all the dialog logic (confirmation, error text)
//! lives here and never inside the supervisor.

use std::path::PathBuf;

use statig::prelude::*;
use tracing::{info, warn};

use crate::config::{FIELDS, Settings};
use crate::vm::command::{build_args, render};
use crate::vm::filesystem::DEFAULT_DISK_FILE;
use crate::vm::{StartError, Supervisor, TerminateError};

pub const TERMINATE_PROMPT: &str = "Are you sure you want to terminate the QEMU process? \
     Any unsaved changes inside the virtual machine will be lost! [y/N]";

const HELP: &str = "\
commands:
  start                   start the VM with the current settings
  stop | terminate        kill the running VM (asks for confirmation)
  status                  show whether the VM is running
  show                    show the current settings
  set <field> <value>     change a setting
  command                 print the QEMU command line `start` would run
  create-disk <GB> [file] create a qcow2 disk image
  save                    write the current settings to the settings file
  help                    show this help
  quit | exit             leave the manager";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched to the console state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// One line typed by the user.
    Input(String),
}

/// Parsed form of a line entered in the `Ready` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Terminate,
    Status,
    Show,
    Set { field: String, value: String },
    PrintCommand,
    CreateDisk { size_gb: u32, target: PathBuf },
    Save,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".to_string());
        };

        let command = match verb {
            "start" => Command::Start,
            "stop" | "terminate" | "kill" => Command::Terminate,
            "status" => Command::Status,
            "show" => Command::Show,
            "set" => {
                let field = words
                    .next()
                    .ok_or_else(|| format!("usage: set <field> <value> (fields: {})", FIELDS.join(", ")))?;
                // Values may contain spaces (paths); keep the remainder verbatim.
                let value = line
                    .trim_start()
                    .strip_prefix("set")
                    .and_then(|rest| rest.trim_start().strip_prefix(field))
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                return Ok(Command::Set {
                    field: field.to_string(),
                    value,
                });
            }
            "command" => Command::PrintCommand,
            "create-disk" => {
                let size = words.next().ok_or("usage: create-disk <GB> [file]")?;
                let size_gb = size
                    .parse::<u32>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("invalid disk size `{size}`: expected a positive number of GB"))?;
                let target = line
                    .trim_start()
                    .strip_prefix("create-disk")
                    .and_then(|rest| rest.trim_start().strip_prefix(size))
                    .map(str::trim)
                    .filter(|rest| !rest.is_empty())
                    .unwrap_or(DEFAULT_DISK_FILE);
                Command::CreateDisk {
                    size_gb,
                    target: PathBuf::from(target),
                }
            }
            "save" => Command::Save,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("unknown command `{other}` (try `help`)")),
        };
        Ok(command)
    }
}

/// Work the console loop performs after the event has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateDisk { size_gb: u32, target: PathBuf },
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything the console owns besides its own state.
pub struct Session {
    pub settings: Settings,
    pub settings_path: PathBuf,
    pub supervisor: Supervisor,
    /// Lines to show the user, drained by the console loop.
    pub output: Vec<String>,
    pub pending: Vec<Action>,
    pub quit: bool,
}

impl Session {
    pub fn new(settings: Settings, settings_path: PathBuf) -> Self {
        let supervisor = Supervisor::new(settings.emulator_dir.clone());
        Self {
            settings,
            settings_path,
            supervisor,
            output: Vec::new(),
            pending: Vec::new(),
            quit: false,
        }
    }

    pub fn say(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    fn start_vm(&mut self) {
        let config = match self.settings.vm.to_config() {
            Ok(config) => config,
            Err(e) => {
                self.say(format!("Unable to start the VM: {e}"));
                return;
            }
        };

        match self.supervisor.start(config) {
            Ok(handle) => {
                let line = format!(
                    "VM started (pid {}, {})",
                    handle.pid(),
                    handle.binary().display()
                );
                self.say(line);
            }
            Err(e @ StartError::BinaryNotFound(_)) => {
                self.say(format!(
                    "Unable to start the VM: {e}. Install QEMU into {} or pass --emulator-dir.",
                    self.supervisor.emulator_dir().display()
                ));
            }
            Err(e) => self.say(format!("Unable to start the VM: {e}")),
        }
    }

    fn status(&mut self) {
        if !self.supervisor.is_running() {
            self.say("The VM is not running");
            return;
        }
        let line = match self.supervisor.handle() {
            Some(handle) => format!(
                "The VM is running (pid {}, {} CPUs, {} MB, up {}s)",
                handle.pid(),
                handle.config().cpu_count,
                handle.config().memory_mb,
                handle.uptime().num_seconds()
            ),
            None => "The VM is running".to_string(),
        };
        self.say(line);
    }

    fn show(&mut self) {
        let emulator = format!("emulator-dir = {}", self.settings.emulator_dir.display());
        self.say(emulator);
        for (field, value) in self.settings.vm.describe() {
            self.say(format!("{field} = {value}"));
        }
    }

    fn print_command(&mut self) {
        match self.settings.vm.to_config() {
            Ok(config) => {
                let binary = self.supervisor.emulator_binary(config.architecture);
                let line = render(&binary.display().to_string(), &build_args(&config));
                self.say(line);
            }
            Err(e) => self.say(format!("Cannot build the QEMU command: {e}")),
        }
    }

    fn save(&mut self) {
        match self.settings.save(&self.settings_path) {
            Ok(()) => {
                let line = format!("Settings saved to {}", self.settings_path.display());
                self.say(line);
            }
            Err(e) => self.say(format!("Unable to save settings: {e:#}")),
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

/// Shared storage for the console state machine.
#[derive(Debug, Default)]
pub struct ConsoleMachine;

#[state_machine(
    initial = "State::ready()",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl ConsoleMachine {
    /// Waiting for a command.
    #[state]
    fn ready(context: &mut Session, event: &ConsoleEvent) -> Outcome<State> {
        let ConsoleEvent::Input(line) = event;
        if line.trim().is_empty() {
            return Handled;
        }

        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                context.say(e);
                return Handled;
            }
        };
        info!(target: "console", ?command, "command");

        match command {
            Command::Start => context.start_vm(),
            Command::Terminate => {
                if !context.supervisor.is_running() {
                    context.say("The VM is not running");
                    return Handled;
                }
                context.say(TERMINATE_PROMPT);
                return Transition(State::confirming_terminate());
            }
            Command::Status => context.status(),
            Command::Show => context.show(),
            Command::Set { field, value } => match context.settings.vm.set(&field, &value) {
                Ok(()) => context.say(format!("{field} updated")),
                Err(e) => context.say(e.to_string()),
            },
            Command::PrintCommand => context.print_command(),
            Command::CreateDisk { size_gb, target } => {
                context.pending.push(Action::CreateDisk { size_gb, target });
            }
            Command::Save => context.save(),
            Command::Help => context.say(HELP),
            Command::Quit => context.quit = true,
        }
        Handled
    }

    /// A terminate was requested; the next line answers the prompt.
    #[state]
    fn confirming_terminate(context: &mut Session, event: &ConsoleEvent) -> Outcome<State> {
        let ConsoleEvent::Input(answer) = event;
        let confirmed = crate::config::parse_bool("answer", answer.trim()).unwrap_or(false);

        match context.supervisor.terminate(confirmed) {
            Ok(()) if confirmed => context.say("VM terminated"),
            Ok(()) => context.say("Termination cancelled"),
            Err(TerminateError::NotRunning) => context.say("The VM is not running"),
            Err(e) => {
                warn!(target: "console", error = %e, "terminate failed");
                context.say(format!("Unable to terminate the VM: {e}"));
            }
        }
        Transition(State::ready())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let mut settings = Settings::default();
        settings.emulator_dir = PathBuf::from("/nonexistent/qemu");
        Session::new(settings, PathBuf::from("/nonexistent/manager.toml"))
    }

    fn input(s: &str) -> ConsoleEvent {
        ConsoleEvent::Input(s.to_string())
    }

    #[test]
    fn parse_commands() {
        assert_eq!(Command::parse("start"), Ok(Command::Start));
        assert_eq!(Command::parse("  kill "), Ok(Command::Terminate));
        assert_eq!(
            Command::parse("create-disk 20"),
            Ok(Command::CreateDisk {
                size_gb: 20,
                target: PathBuf::from(DEFAULT_DISK_FILE)
            })
        );
        assert!(Command::parse("create-disk zero").is_err());
        assert!(Command::parse("create-disk 0").is_err());
        assert!(Command::parse("reboot").is_err());
    }

    #[test]
    fn parse_set_keeps_spaces_in_value() {
        assert_eq!(
            Command::parse("set disk /home/me/My VMs/win.qcow2"),
            Ok(Command::Set {
                field: "disk".to_string(),
                value: "/home/me/My VMs/win.qcow2".to_string(),
            })
        );
    }

    #[test]
    fn parse_create_disk_keeps_spaces_in_target() {
        assert_eq!(
            Command::parse("create-disk 8 My Disk.qcow2"),
            Ok(Command::CreateDisk {
                size_gb: 8,
                target: PathBuf::from("My Disk.qcow2")
            })
        );
        assert_eq!(
            Command::parse("create-disk 8   "),
            Ok(Command::CreateDisk {
                size_gb: 8,
                target: PathBuf::from(DEFAULT_DISK_FILE)
            })
        );
    }

    #[test]
    fn stop_without_vm_stays_ready() {
        let mut session = session();
        let mut sm = ConsoleMachine.state_machine();

        sm.handle_with_context(&input("stop"), &mut session);

        assert_eq!(sm.state(), &State::ready());
        assert_eq!(session.take_output(), ["The VM is not running"]);
    }

    #[test]
    fn start_reports_missing_binary() {
        let mut session = session();
        session.settings.vm.disk = Some(PathBuf::from("disk.qcow2"));
        let mut sm = ConsoleMachine.state_machine();

        sm.handle_with_context(&input("start"), &mut session);

        let out = session.take_output();
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("Unable to start the VM: QEMU binary not found"));
        assert!(!session.supervisor.is_running());
    }

    #[test]
    fn start_without_disk_is_a_form_error() {
        let mut session = session();
        let mut sm = ConsoleMachine.state_machine();

        sm.handle_with_context(&input("start"), &mut session);

        assert_eq!(
            session.take_output(),
            ["Unable to start the VM: a hard disk image path is required"]
        );
    }

    #[test]
    fn set_then_show() {
        let mut session = session();
        let mut sm = ConsoleMachine.state_machine();

        sm.handle_with_context(&input("set cpus 2"), &mut session);
        sm.handle_with_context(&input("set cpus nope"), &mut session);
        assert_eq!(session.settings.vm.cpus, 2);

        sm.handle_with_context(&input("show"), &mut session);
        let out = session.take_output();
        assert_eq!(out[0], "cpus updated");
        assert!(out[1].contains("cpus"));
        assert!(out.contains(&"cpus = 2".to_string()));
    }

    #[test]
    fn create_disk_is_deferred_to_the_loop() {
        let mut session = session();
        let mut sm = ConsoleMachine.state_machine();

        sm.handle_with_context(&input("create-disk 8 vm.qcow2"), &mut session);

        assert_eq!(
            session.pending,
            [Action::CreateDisk {
                size_gb: 8,
                target: PathBuf::from("vm.qcow2")
            }]
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_prints_the_invocation() {
        let mut session = session();
        session.settings.vm.disk = Some(PathBuf::from("disk.qcow2"));
        let mut sm = ConsoleMachine.state_machine();

        sm.handle_with_context(&input("command"), &mut session);

        let out = session.take_output();
        assert!(out[0].starts_with("/nonexistent/qemu/qemu-system-x86_64"));
        assert!(out[0].contains("-boot menu=on"));
    }

    #[test]
    fn quit_sets_flag() {
        let mut session = session();
        let mut sm = ConsoleMachine.state_machine();
        sm.handle_with_context(&input("quit"), &mut session);
        assert!(session.quit);
    }
}
