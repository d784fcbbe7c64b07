//! CLI argument definitions for chartbox.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! driving the sandbox.

use std::path::PathBuf;

use chartbox_sandbox::OptionPath;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

/// chartbox -- sandboxed chart option callbacks.
#[derive(Parser)]
#[command(
    name = "chartbox",
    version,
    about = "Screen and run chart option callbacks in an isolated V8 sandbox"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check whether a callback source passes the static screener.
    Screen {
        /// The function literal to screen.
        source: String,
    },

    /// Revive callbacks in a JSON option document and optionally call them.
    Revive(ReviveArgs),
}

#[derive(Args)]
pub struct ReviveArgs {
    /// Option document to load, or `-` for stdin.
    #[arg(long, short)]
    pub options: PathBuf,

    /// Dotted path of a callback to revive. Repeatable.
    #[arg(long = "path", short = 'p', value_parser = parse_path)]
    pub paths: Vec<OptionPath>,

    /// Also revive `series.N.symbolSize` and `series.N.itemStyle.color`.
    #[arg(long)]
    pub series: bool,

    /// Call a revived callback as `PATH=[JSON, ...]`. Repeatable.
    #[arg(long = "call", short = 'c', value_parser = parse_call)]
    pub calls: Vec<CallSpec>,
}

/// One requested invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSpec {
    pub path: OptionPath,
    pub args: Vec<Value>,
}

fn parse_path(raw: &str) -> Result<OptionPath, String> {
    raw.parse().map_err(|e| format!("{e}"))
}

pub fn parse_call(raw: &str) -> Result<CallSpec, String> {
    let (path, args) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected PATH=JSON_ARGS, got `{raw}`"))?;
    let path = parse_path(path)?;
    match serde_json::from_str::<Value>(args) {
        Ok(Value::Array(args)) => Ok(CallSpec { path, args }),
        Ok(other) => Err(format!("call arguments must be a JSON array, got `{other}`")),
        Err(e) => Err(format!("invalid JSON arguments: {e}")),
    }
}
