use argh::FromArgs;
use chronosh::{Shell, logging};

#[derive(FromArgs)]
/// Interactive command launcher with asynchronous job timing.
struct Options {
    #[argh(option, short = 'l')]
    /// log level: error, warn, info, debug or trace
    log_level: Option<String>,
}

fn main() {
    let options: Options = argh::from_env();
    if let Err(err) = run(&options) {
        eprintln!("chronosh: {err:#}");
        std::process::exit(1);
    }
}

fn run(options: &Options) -> anyhow::Result<()> {
    logging::init(options.log_level.as_deref())?;
    let mut shell = Shell::new()?;
    shell.repl()
}
