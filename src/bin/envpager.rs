use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

use anyhow::{Context, Result, bail};
use argh::FromArgs;

#[derive(FromArgs)]
/// List environment variables through `printenv | grep | sort | pager`.
/// Arguments are handed to grep verbatim; without arguments the whole
/// environment is listed. The pager comes from PAGER, defaulting to less
/// and falling back to more.
struct Options {
    #[argh(positional, greedy)]
    /// patterns and flags to filter the listing with
    grep_args: Vec<String>,
}

fn main() {
    let options: Options = argh::from_env();
    if let Err(err) = run(&options) {
        eprintln!("envpager: {err:#}");
        std::process::exit(1);
    }
}

fn run(options: &Options) -> Result<()> {
    let mut printenv = Command::new("printenv")
        .stdout(Stdio::piped())
        .spawn()
        .context("can't spawn printenv")?;
    let mut upstream = printenv.stdout.take().context("printenv stdout missing")?;

    // grep only joins the chain when there is something to filter by.
    let grep = if options.grep_args.is_empty() {
        None
    } else {
        let mut child = Command::new("grep")
            .args(&options.grep_args)
            .stdin(Stdio::from(upstream))
            .stdout(Stdio::piped())
            .spawn()
            .context("can't spawn grep")?;
        upstream = child.stdout.take().context("grep stdout missing")?;
        Some(child)
    };

    let mut sort = Command::new("sort")
        .stdin(Stdio::from(upstream))
        .stdout(Stdio::piped())
        .spawn()
        .context("can't spawn sort")?;
    let sorted = sort.stdout.take().context("sort stdout missing")?;

    let mut pager = spawn_pager(sorted)?;

    check_stage("printenv", printenv.wait()?)?;
    if let Some(mut child) = grep {
        let status = child.wait()?;
        // grep exits 1 when nothing matched; that is still a clean run.
        match status.code() {
            Some(0) | Some(1) => {}
            _ => fail_stage("grep", status)?,
        }
    }
    check_stage("sort", sort.wait()?)?;
    check_stage("pager", pager.wait()?)?;
    Ok(())
}

fn spawn_pager(input: ChildStdout) -> Result<Child> {
    let input: OwnedFd = input.into();
    let chosen = std::env::var("PAGER").unwrap_or_else(|_| "less".to_string());
    let fallback = "more";

    let first_try = input.try_clone().context("can't duplicate pager input")?;
    match Command::new(&chosen).stdin(Stdio::from(first_try)).spawn() {
        Ok(child) => Ok(child),
        Err(err) if chosen != fallback => {
            eprintln!("envpager: {chosen}: {err}; trying {fallback}");
            Command::new(fallback)
                .stdin(Stdio::from(input))
                .spawn()
                .with_context(|| format!("can't spawn {fallback}"))
        }
        Err(err) => Err(err).with_context(|| format!("can't spawn {chosen}")),
    }
}

fn check_stage(name: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        fail_stage(name, status)
    }
}

fn fail_stage(name: &str, status: ExitStatus) -> Result<()> {
    match status.code() {
        Some(code) => bail!("{name} exited with status {code}"),
        None => match status.signal() {
            Some(signal) => bail!("{name} was terminated by signal {signal}"),
            None => bail!("{name} did not exit normally"),
        },
    }
}
