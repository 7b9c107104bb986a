//! Line-oriented command REPL (`spec.md` §6, `SPEC_FULL.md` §4.11).
//!
//! Each line is whitespace-split and dispatched to [`btide_node::Node`].
//! This is intentionally thin: no history, no editing, no completion —
//! the crate's non-goal is CLI ergonomics, not the engine underneath it.

use std::io::{self, BufRead, Write};
use std::path::Path;

use btide_node::Node;
use eyre::{eyre, Result as EyreResult};

pub fn run(node: &Node, home: &Path) -> EyreResult<()> {
    let stdin = io::stdin();
    print_prompt();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            print_prompt();
            continue;
        }
        if let Err(err) = dispatch(node, home, line) {
            println!("error: {err}");
        }
        print_prompt();
    }
    node.shutdown();
    Ok(())
}

fn print_prompt() {
    print!("btide> ");
    let _ = io::stdout().flush();
}

fn dispatch(node: &Node, home: &Path, line: &str) -> EyreResult<()> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next().unwrap_or_default().to_ascii_uppercase();

    match cmd.as_str() {
        "CONNECT" => {
            let (ip, port) = parse_addr(&mut parts)?;
            node.connect(&ip, port)?;
            println!("connected to {ip}:{port}");
        }
        "DISCONNECT" => {
            let (ip, port) = parse_addr(&mut parts)?;
            node.disconnect(&ip, port);
            println!("disconnect requested for {ip}:{port}");
        }
        "ADDPACKAGE" => {
            let manifest = parts
                .next()
                .ok_or_else(|| eyre!("usage: ADDPACKAGE <manifest>"))?;
            let path = home.join(manifest);
            let check = node.packages.add(&path)?;
            println!("package loaded ({check:?})");
        }
        "REMPACKAGE" => {
            let ident = parts
                .next()
                .ok_or_else(|| eyre!("usage: REMPACKAGE <ident>"))?;
            node.packages.remove(ident);
            println!("package removed");
        }
        "PACKAGES" => {
            for ident in node.packages.idents() {
                println!("{ident}");
            }
        }
        "PEERS" => {
            for peer in node.registry.snapshot() {
                println!("{}", peer.id);
            }
        }
        "FETCH" => {
            let (ip, port) = parse_addr(&mut parts)?;
            let ident = parts
                .next()
                .ok_or_else(|| eyre!("usage: FETCH <ip> <port> <ident> <chunk_hash>"))?;
            let chunk_hash = parts
                .next()
                .ok_or_else(|| eyre!("usage: FETCH <ip> <port> <ident> <chunk_hash>"))?;
            node.fetch_by_hash(&ip, port, ident, chunk_hash)?;
            println!("fetch enqueued");
        }
        other => {
            println!("unknown command: {other}");
        }
    }
    Ok(())
}

fn parse_addr<'a>(parts: &mut impl Iterator<Item = &'a str>) -> EyreResult<(String, u16)> {
    let ip = parts
        .next()
        .ok_or_else(|| eyre!("missing <ip>"))?
        .to_owned();
    let port: u16 = parts
        .next()
        .ok_or_else(|| eyre!("missing <port>"))?
        .parse()
        .map_err(|_| eyre!("<port> must be a number"))?;
    Ok((ip, port))
}
