use anyhow::{Result, bail};
use tracing::Level;

const LEVEL_ENV_VAR: &str = "CHRONOSH_LOG";
const DEFAULT_LEVEL: Level = Level::WARN;

/// Initialize the tracing subscriber. Precedence: explicit CLI level,
/// then the CHRONOSH_LOG environment variable, then warn. Output goes to
/// stderr; stdout belongs to the prompt and the completion lines.
pub fn init(cli_level: Option<&str>) -> Result<()> {
    let level = match cli_level {
        Some(name) => parse_level(name)?,
        None => match std::env::var(LEVEL_ENV_VAR) {
            Ok(name) => parse_level(&name)?,
            Err(_) => DEFAULT_LEVEL,
        },
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn parse_level(name: &str) -> Result<Level> {
    match name.to_ascii_lowercase().as_str() {
        "error" => Ok(Level::ERROR),
        "warn" => Ok(Level::WARN),
        "info" => Ok(Level::INFO),
        "debug" => Ok(Level::DEBUG),
        "trace" => Ok(Level::TRACE),
        _ => bail!("unknown log level: {name}"),
    }
}
