use anyhow::{Context, Result};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::debug;

use crate::builtin;
use crate::env::Environment;
use crate::launcher;
use crate::notify::{self, CompletionReceiver, CompletionRecord};
use crate::reaper::{self, ReaperState};
use crate::tokenize;

const PROMPT: &str = "> ";

/// The interactive loop: reads commands, dispatches them, and prints the
/// completion lines the reaper queues up.
pub struct Shell {
    env: Environment,
    reaper: &'static ReaperState,
    receiver: CompletionReceiver,
}

impl Shell {
    /// Wire the completion channel, publish the reaper state, and set the
    /// signal dispositions. Any failure here is fatal; the shell cannot
    /// run without its reaper.
    pub fn new() -> Result<Self> {
        let (sender, receiver) = notify::channel()?;
        // The handler outlives every scope, so the state it reads must too.
        let reaper: &'static ReaperState = Box::leak(Box::new(ReaperState::new(sender)));
        reaper::install(reaper)?;
        reaper::ignore_sigint()?;
        Ok(Self {
            env: Environment::new(),
            reaper,
            receiver,
        })
    }

    /// Run until end of input or the exit builtin.
    pub fn repl(&mut self) -> Result<()> {
        let mut editor = DefaultEditor::new().context("line editor setup failed")?;
        loop {
            // Everything that finished while the last command ran, or
            // while we sat at the prompt, is reported before the next
            // read.
            self.drain_completions()?;
            match editor.readline(PROMPT) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        editor.add_history_entry(line.as_str())?;
                    }
                    self.dispatch(&line)?;
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(ReadlineError::Io(err))
                    if err.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(err) => return Err(err).context("reading input failed"),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, line: &str) -> Result<()> {
        let Some(command) = tokenize::parse_line(line) else {
            return Ok(());
        };

        if let Some(result) = builtin::dispatch(&command.argv, &mut std::io::stdout(), &mut self.env)
        {
            let code = result?;
            debug!(command = %command.argv[0], code, "builtin finished");
            return Ok(());
        }

        match launcher::launch(self.reaper, &command.argv, command.background) {
            Ok(handle) if handle.background => {
                println!("[{}] started", handle.pid);
            }
            Ok(handle) => {
                self.receiver
                    .wait_for(handle.pid)
                    .context("waiting for foreground job failed")?;
            }
            // A failed launch leaves the loop running.
            Err(err) => {
                eprintln!("chronosh: {err:#}");
            }
        }
        Ok(())
    }

    fn drain_completions(&mut self) -> Result<()> {
        while let Some(record) = self.receiver.try_next()? {
            println!("{}", format_completion(&record));
        }
        Ok(())
    }
}

/// Single source of truth for the console forms. A signal death wins over
/// everything, background jobs report untimed, and the unknown-elapsed
/// sentinel downgrades a foreground report to the bare form.
fn format_completion(record: &CompletionRecord) -> String {
    if record.signaled {
        format!("Process {} terminated by signal.", record.pid)
    } else if record.background {
        format!("Background process {} terminated.", record.pid)
    } else if record.elapsed_millis >= 0 {
        format!(
            "Process {} terminated, {} milliseconds.",
            record.pid, record.elapsed_millis
        )
    } else {
        format!("Process {} terminated.", record.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(elapsed: i64, background: bool, signaled: bool) -> CompletionRecord {
        CompletionRecord {
            pid: 4321,
            elapsed_millis: elapsed,
            background,
            signaled,
        }
    }

    #[test]
    fn foreground_form_carries_the_timing() {
        assert_eq!(
            format_completion(&record(1043, false, false)),
            "Process 4321 terminated, 1043 milliseconds."
        );
    }

    #[test]
    fn zero_milliseconds_is_still_timed() {
        assert_eq!(
            format_completion(&record(0, false, false)),
            "Process 4321 terminated, 0 milliseconds."
        );
    }

    #[test]
    fn background_form_is_untimed() {
        assert_eq!(
            format_completion(&record(1043, true, false)),
            "Background process 4321 terminated."
        );
    }

    #[test]
    fn signal_form_wins_over_background() {
        assert_eq!(
            format_completion(&record(0, true, true)),
            "Process 4321 terminated by signal."
        );
    }

    #[test]
    fn unknown_elapsed_drops_the_timing_clause() {
        assert_eq!(
            format_completion(&record(notify::ELAPSED_UNKNOWN, false, false)),
            "Process 4321 terminated."
        );
    }
}
