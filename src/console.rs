//! Interactive console loop.
//!
//! Runs on a single-threaded Tokio runtime. Each iteration waits for either a
//! line on stdin or the liveness poll tick, feeds input to the
//! [`ConsoleMachine`], prints whatever the session produced, then performs
//! deferred work (disk creation, attaching the emulator's output streams).
//!
//! ```text
//! stdin line ──► ConsoleMachine::handle_with_context(Session)
//! poll tick  ──► Supervisor::poll_exit ──► "The VM exited"
//! Ctrl-C     ──► leave the loop, run the shutdown hook
//! ```

use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use statig::prelude::*;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info};

use crate::state_machine::console_sm::{Action, State};
use crate::state_machine::{ConsoleEvent, ConsoleMachine, Session};
use crate::vm::filesystem::{create_disk_image, image_tool_path};

/// How often the emulator is polled for an unexpected exit.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run the console until `quit` or end of input, then run the supervisor's
/// shutdown hook.
pub async fn run(mut session: Session) -> anyhow::Result<()> {
    let mut machine = ConsoleMachine.state_machine();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    println!("qemu-manager v{}", env!("CARGO_PKG_VERSION"));
    println!("Type `help` for a list of commands.");
    prompt(machine.state())?;

    loop {
        let mut answered = false;

        tokio::select! {
            line = lines.next_line() => {
                match line.context("read console input")? {
                    Some(line) => {
                        machine.handle_with_context(&ConsoleEvent::Input(line), &mut session);
                        answered = true;
                    }
                    None => {
                        info!("console input closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = poll.tick() => {
                if let Some(status) = session.supervisor.poll_exit() {
                    session.say(format!("The VM exited ({status})"));
                }
            }
        }

        attach_output(&mut session);

        for action in std::mem::take(&mut session.pending) {
            perform(&mut session, action).await;
        }

        let output = session.take_output();
        for line in &output {
            println!("{line}");
        }

        if session.quit {
            break;
        }
        if answered || !output.is_empty() {
            prompt(machine.state())?;
        }
    }

    session.supervisor.shutdown_hook();
    Ok(())
}

fn prompt(state: &State) -> anyhow::Result<()> {
    let text = match state {
        State::ConfirmingTerminate {} => "? ",
        _ => "> ",
    };
    let mut stdout = std::io::stdout();
    write!(stdout, "{text}").context("write prompt")?;
    stdout.flush().context("flush prompt")?;
    Ok(())
}

async fn perform(session: &mut Session, action: Action) {
    match action {
        Action::CreateDisk { size_gb, target } => {
            let tool = image_tool_path(&session.settings.emulator_dir);
            match create_disk_image(&tool, &target, size_gb).await {
                Ok(()) => session.say(format!(
                    "Created {size_gb} GB disk image {}",
                    target.display()
                )),
                Err(e) => session.say(format!("Unable to create the disk image: {e}")),
            }
        }
    }
}

/// Move the emulator's stdout/stderr, if not yet taken, into background
/// tasks that forward each line to the log.
fn attach_output(session: &mut Session) {
    let Some((stdout, stderr)) = session.supervisor.take_output() else {
        return;
    };
    if let Some(stdout) = stdout {
        tokio::spawn(forward_lines(stdout, "stdout"));
    }
    if let Some(stderr) = stderr {
        tokio::spawn(forward_lines(stderr, "stderr"));
    }
}

async fn forward_lines<R>(stream: R, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "qemu", stream = name, "{line}");
    }
    debug!(target: "qemu", stream = name, "stream closed");
}
