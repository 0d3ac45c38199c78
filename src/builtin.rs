use std::env as stdenv;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argh::{EarlyExit, FromArgs};

use crate::env::Environment;

/// Conventional exit code: 0 for success, non-zero for failure.
pub type ExitCode = i32;

/// Commands handled by the shell itself, never forked.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed
/// directly in-process. Diagnostics go to the provided sink so tests can
/// capture them.
pub trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "cd".
    fn name() -> &'static str;

    /// Return value follows shell conventions: 0 for success, non-zero
    /// for error.
    fn execute(self, out: &mut dyn Write, env: &mut Environment) -> Result<ExitCode>;
}

/// Run `argv` as a builtin if its name matches one. `None` means the
/// command is not a builtin and belongs to the launcher.
pub fn dispatch(
    argv: &[String],
    out: &mut dyn Write,
    env: &mut Environment,
) -> Option<Result<ExitCode>> {
    let name = argv.first()?.as_str();
    if name == Cd::name() {
        Some(run::<Cd>(name, &argv[1..], out, env))
    } else if name == Exit::name() {
        Some(run::<Exit>(name, &argv[1..], out, env))
    } else {
        None
    }
}

fn run<T: BuiltinCommand>(
    name: &str,
    args: &[String],
    out: &mut dyn Write,
    env: &mut Environment,
) -> Result<ExitCode> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match T::from_args(&[name], &args) {
        Ok(command) => command.execute(out, env),
        // argh delivers --help text and usage errors the same way.
        Err(EarlyExit { output, status }) => {
            writeln!(out, "{}", output.trim_end())?;
            Ok(if status.is_err() { 1 } else { 0 })
        }
    }
}

#[derive(FromArgs)]
/// Change the current working directory. With no target, or when the
/// target cannot be entered, falls back to the directory named by HOME.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to, absolute or relative to the current one
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn execute(self, out: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        if let Some(target) = self.target.as_deref().filter(|t| !t.is_empty()) {
            let requested = if Path::new(target).is_absolute() {
                PathBuf::from(target)
            } else {
                env.current_dir.join(target)
            };
            match change_dir(env, &requested) {
                Ok(()) => return Ok(0),
                // A bad target is a diagnostic, never a shell error.
                Err(err) => {
                    writeln!(out, "cd: {target}: {err:#}; falling back to home")?;
                    self.enter_home(out, env)?;
                    return Ok(1);
                }
            }
        }
        self.enter_home(out, env)
    }
}

impl Cd {
    fn enter_home(&self, out: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        let Some(home) = env.home_dir() else {
            writeln!(out, "cd: HOME not set")?;
            return Ok(1);
        };
        match change_dir(env, &home) {
            Ok(()) => Ok(0),
            Err(err) => {
                writeln!(out, "cd: {}: {err:#}", home.display())?;
                Ok(1)
            }
        }
    }
}

fn change_dir(env: &mut Environment, target: &Path) -> Result<()> {
    let canonical = fs::canonicalize(target)
        .with_context(|| format!("can't canonicalize {}", target.display()))?;
    stdenv::set_current_dir(&canonical)
        .with_context(|| format!("can't chdir to {}", canonical.display()))?;
    env.current_dir = canonical;
    Ok(())
}

#[derive(FromArgs)]
/// Leave the shell immediately.
pub struct Exit {
    #[argh(positional, greedy)]
    /// ignored; the shell always exits with status 0
    pub _args: Vec<String>,
}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn execute(self, _out: &mut dyn Write, _env: &mut Environment) -> Result<ExitCode> {
        std::process::exit(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    // The process-wide working directory is shared state; tests that
    // chdir take this lock.
    fn lock_current_dir() -> MutexGuard<'static, ()> {
        static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        MUTEX.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    fn test_env() -> Environment {
        Environment {
            vars: HashMap::new(),
            current_dir: stdenv::current_dir().unwrap(),
        }
    }

    #[test]
    fn cd_to_an_absolute_path() {
        let _lock = lock_current_dir();
        let temp = tempfile::tempdir().unwrap();
        let canonical = fs::canonicalize(temp.path()).unwrap();
        let orig = stdenv::current_dir().unwrap();

        let mut env = test_env();
        let cmd = Cd {
            target: Some(canonical.to_string_lossy().to_string()),
        };
        let mut out = Vec::new();
        let code = cmd.execute(&mut out, &mut env).unwrap();

        assert_eq!(code, 0);
        assert_eq!(env.current_dir, canonical);
        assert_eq!(stdenv::current_dir().unwrap(), canonical);
        assert!(out.is_empty());

        stdenv::set_current_dir(orig).unwrap();
    }

    #[test]
    fn cd_without_target_goes_home() {
        let _lock = lock_current_dir();
        let temp = tempfile::tempdir().unwrap();
        let canonical = fs::canonicalize(temp.path()).unwrap();
        let orig = stdenv::current_dir().unwrap();

        let mut env = test_env();
        env.set_var("HOME", canonical.to_string_lossy().to_string());

        let cmd = Cd { target: None };
        let mut out = Vec::new();
        let code = cmd.execute(&mut out, &mut env).unwrap();

        assert_eq!(code, 0);
        assert_eq!(env.current_dir, canonical);

        stdenv::set_current_dir(orig).unwrap();
    }

    #[test]
    fn cd_bad_target_falls_back_to_home() {
        let _lock = lock_current_dir();
        let temp = tempfile::tempdir().unwrap();
        let canonical = fs::canonicalize(temp.path()).unwrap();
        let orig = stdenv::current_dir().unwrap();

        let mut env = test_env();
        env.set_var("HOME", canonical.to_string_lossy().to_string());

        let cmd = Cd {
            target: Some(format!("/nonexistent_{}", std::process::id())),
        };
        let mut out = Vec::new();
        let code = cmd.execute(&mut out, &mut env).unwrap();

        assert_eq!(code, 1);
        assert_eq!(env.current_dir, canonical);
        assert_eq!(stdenv::current_dir().unwrap(), canonical);
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("cd:"));
        assert!(printed.contains("falling back to home"));

        stdenv::set_current_dir(orig).unwrap();
    }

    #[test]
    fn cd_survives_an_unusable_home() {
        let _lock = lock_current_dir();
        let orig = stdenv::current_dir().unwrap();

        let mut env = test_env();
        env.set_var("HOME", format!("/nonexistent_home_{}", std::process::id()));

        let cmd = Cd { target: None };
        let mut out = Vec::new();
        let code = cmd.execute(&mut out, &mut env).unwrap();

        assert_eq!(code, 1);
        assert_eq!(stdenv::current_dir().unwrap(), orig);
        assert!(String::from_utf8(out).unwrap().contains("cd:"));
    }

    #[test]
    fn dispatch_ignores_external_commands() {
        let mut env = test_env();
        let mut out = Vec::new();
        let argv = vec!["ls".to_string()];
        assert!(dispatch(&argv, &mut out, &mut env).is_none());
    }

    #[test]
    fn dispatch_reports_builtin_usage_errors() {
        let mut env = test_env();
        let mut out = Vec::new();
        let argv: Vec<String> = ["cd", "a", "b"].iter().map(|s| s.to_string()).collect();

        let code = dispatch(&argv, &mut out, &mut env).unwrap().unwrap();

        assert_eq!(code, 1);
        assert!(!out.is_empty());
    }

    #[test]
    fn dispatch_prints_help_without_failing() {
        let mut env = test_env();
        let mut out = Vec::new();
        let argv: Vec<String> = ["cd", "--help"].iter().map(|s| s.to_string()).collect();

        let code = dispatch(&argv, &mut out, &mut env).unwrap().unwrap();

        assert_eq!(code, 0);
        assert!(String::from_utf8(out).unwrap().contains("Usage"));
    }
}
