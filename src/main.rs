use anyhow::{Context, Result};
use clap::Parser;
use gopherbot_mcp::config::load_config;
use gopherbot_mcp::server::run_stdio_server;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "gopherbot-mcp")]
#[command(version)]
#[command(about = "MCP stdio server that starts, stops and talks to local Gopherbot robots")]
struct Cli {
    /// Root for resolving relative `robot_dir` / `gopherbot_binary` paths.
    /// Defaults to the current working directory.
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = std::env::current_dir().context("Failed to get current dir")?;
    let root = match cli.root {
        Some(p) if p.is_absolute() => p,
        Some(p) => cwd.join(p),
        None => cwd,
    };

    let cfg = load_config(&root);
    eprintln!("[gopherbot-mcp] INFO: serving MCP on stdio, root={}", root.display());

    run_stdio_server(root, cfg)
}
