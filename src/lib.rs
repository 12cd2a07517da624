pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod message;
pub mod node;
pub mod scripting;

use std::{
    io::{self, BufRead},
    iter,
    path::PathBuf,
    process,
    rc::Rc,
};

use clap::Parser;

use config::BridgeConfig;
use host::StdioHost;
use message::{Atom, Message};
use node::ScriptNode;

#[derive(Parser, Debug)]
#[command(name = "patchlua")]
#[command(about = "Run a Lua script node, feeding it messages from stdin")]
struct Args {
    /// Bridge configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Additional script search directory; may be repeated
    #[arg(long = "search")]
    search: Vec<PathBuf>,

    /// Script file
    script: String,

    /// Further construction arguments, exposed as `jsarguments`
    args: Vec<String>,
}

/// Command-line runner: one node, one message per stdin line.
///
/// A line may start with `@N` to deliver on inlet `N`.
pub fn run() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match BridgeConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                process::exit(2);
            }
        },
        None => BridgeConfig::default(),
    };
    logging::init(&config.log_filter);

    config.search_paths.extend(args.search);
    if let Ok(cwd) = std::env::current_dir() {
        config.search_paths.push(cwd);
    }

    let host = Rc::new(StdioHost::new(config.resolver()));
    let arguments = iter::once(&args.script)
        .chain(&args.args)
        .map(|a| Atom::parse(a))
        .collect();

    // construction errors were already reported through the host
    let Ok(node) = ScriptNode::new(host, config, arguments) else {
        process::exit(1);
    };
    let _ = node.loadbang();

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::error!("[node] stdin: {e}");
                break;
            }
        };
        let (inlet, text) = split_inlet(&line);
        if let Some(message) = Message::parse(text) {
            let _ = node.deliver(inlet, &message.selector, &message.atoms);
        }
    }
}

/// `@2 foo 1` -> (2, "foo 1"). Lines without a prefix go to inlet 0.
fn split_inlet(line: &str) -> (usize, &str) {
    let trimmed = line.trim_start();
    let Some(rest) = trimmed.strip_prefix('@') else {
        return (0, trimmed);
    };
    let (index, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    match index.parse() {
        Ok(inlet) => (inlet, text),
        Err(_) => (0, trimmed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inlet_prefix() {
        assert_eq!(split_inlet("@2 foo 1"), (2, "foo 1"));
        assert_eq!(split_inlet("  bang"), (0, "bang"));
        assert_eq!(split_inlet("@1"), (1, ""));
        assert_eq!(split_inlet("@x bang"), (0, "@x bang"));
    }

    #[test]
    fn cli_arguments() {
        let args = Args::parse_from(["patchlua", "--search", "/tmp", "synth.lua", "440", "saw"]);
        assert_eq!(args.script, "synth.lua");
        assert_eq!(args.args, vec!["440", "saw"]);
        assert_eq!(args.search, vec![PathBuf::from("/tmp")]);
        assert!(args.config.is_none());
    }
}
