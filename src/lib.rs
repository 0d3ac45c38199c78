//! An interactive command launcher that times its jobs.
//!
//! chronosh runs external programs in the foreground or, with a trailing
//! `&`, in the background, and reports how long each one took once it
//! ends. Terminated children are collected by a SIGCHLD handler that
//! never touches the console: it writes fixed-size completion records
//! into a self-pipe, and the prompt loop drains that pipe between
//! commands. The handler side is restricted to async-signal-safe
//! operations, and the elapsed-time registry it shares with the launcher
//! is a fixed table of atomics, so no lock or allocation sits on the
//! signal path.
//!
//! The main entry point is [`Shell`]. A second binary, `envpager`, ships
//! a straight-line `printenv | grep | sort | pager` pipeline for browsing
//! the environment.

mod builtin;
mod env;
mod launcher;
pub mod logging;
mod notify;
mod reaper;
mod shell;
mod timing;
mod tokenize;

pub use shell::Shell;
