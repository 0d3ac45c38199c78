/// One parsed command line: argv plus the background marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub argv: Vec<String>,
    pub background: bool,
}

/// Split a raw line into whitespace-delimited arguments, taking one
/// trailing `&` (spaced or glued to the last word) as the background
/// marker. Blank lines and a bare `&` yield `None`.
pub fn parse_line(line: &str) -> Option<CommandLine> {
    let trimmed = line.trim();
    let (body, background) = match trimmed.strip_suffix('&') {
        Some(rest) => (rest, true),
        None => (trimmed, false),
    };
    let argv: Vec<String> = body.split_whitespace().map(str::to_owned).collect();
    if argv.is_empty() {
        return None;
    }
    Some(CommandLine { argv, background })
}
