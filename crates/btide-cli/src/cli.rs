//! Startup flags (`SPEC_FULL.md` §4.11): `clap` is used only for the
//! binary's subcommands, not the per-line REPL grammar parsed by
//! [`crate::repl`].

use std::path::PathBuf;
use std::sync::Arc;

use btide_node::{listener, Node, NodeConfig};
use clap::{Parser, Subcommand};
use eyre::{bail, Result as EyreResult, WrapErr};

#[derive(Debug, Parser)]
#[command(author, version, about = "BitTorrent-style peer-to-peer file distribution node")]
pub struct RootCommand {
    /// Directory holding `btide.toml` and the node's manifests.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub home: PathBuf,

    #[command(subcommand)]
    pub action: SubCommand,
}

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    /// Write a default `btide.toml` into `--home`.
    Init,
    /// Load `btide.toml`, bind the listener, and run the command REPL.
    Run {
        /// Override the configured bind port.
        #[arg(long)]
        listen: Option<u16>,
    },
}

impl RootCommand {
    pub fn run(self) -> EyreResult<()> {
        match self.action {
            SubCommand::Init => init(&self.home),
            SubCommand::Run { listen } => run(&self.home, listen),
        }
    }
}

fn init(home: &std::path::Path) -> EyreResult<()> {
    if NodeConfig::exists(home) {
        bail!("btide.toml already exists in {home:?}");
    }
    std::fs::create_dir_all(home).wrap_err_with(|| format!("failed to create {home:?}"))?;
    let config = NodeConfig::default();
    config.save(home)?;
    tracing::info!(dir = ?home, "wrote default btide.toml");
    Ok(())
}

fn run(home: &std::path::Path, listen_override: Option<u16>) -> EyreResult<()> {
    if !NodeConfig::exists(home) {
        bail!("node is not initialized in {home:?}; run `btide --home {home:?} init` first");
    }
    let mut config = NodeConfig::load(home)?;
    if let Some(port) = listen_override {
        config.bind_port = port;
    }
    std::fs::create_dir_all(home.join(&config.manifest_dir))
        .wrap_err("failed to create manifest directory")?;

    let node = Arc::new(Node::new(config));
    let bound = listener::bind(&node).wrap_err("failed to bind listener")?;
    tracing::info!(addr = ?bound.local_addr(), "btide node listening");

    let listener_node = Arc::clone(&node);
    std::thread::spawn(move || listener::serve(listener_node, bound));

    crate::repl::run(&node, home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_refuses_to_overwrite_existing_config() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path()).unwrap();
        assert!(NodeConfig::exists(dir.path()));
        let err = init(dir.path()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn run_refuses_uninitialized_home() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }
}
