//! Command dispatch.
//!
//! Every command resolves its `cpm:<name>` feature through the registry
//! before running, so plugin-supplied commands and builtins share one
//! namespace with ambiguity detection.

use anyhow::Result;
use std::path::Path;

use crate::app::CpmApp;
use crate::args::{Cli, Command};
use crate::output;

mod benchmark;
mod build;
mod diff;
mod doctor;
mod embed;
mod install;
mod pkg;
mod plugins;
mod pool;
mod query;
mod replay;

pub fn dispatch(cli: Cli) -> Result<i32> {
    let start_dir = Path::new(&cli.workspace_dir);
    let command_name = feature_name(&cli.command);

    let app = match CpmApp::bootstrap(start_dir) {
        Ok(app) => app,
        Err(e) => {
            output::error_line(command_name, format!("workspace bootstrap failed: {e}"), None);
            return Ok(1);
        }
    };
    if let Err(e) = app.resolve_command(&format!("cpm:{command_name}")) {
        output::error_line(command_name, e.to_string(), None);
        return Ok(1);
    }

    let code = match cli.command {
        Command::Build { action } => build::run(&app, action),
        Command::Query(args) => query::run(&app, args),
        Command::Replay { log } => replay::run(&app, &log),
        Command::Diff {
            left,
            right,
            max_drift,
        } => diff::run(&app, &left, &right, max_drift),
        Command::Install(args) => install::run(&app, args),
        Command::Uninstall { name } => pkg::uninstall(&app, &name),
        Command::Use { spec } => pkg::use_version(&app, &spec),
        Command::Prune { name, keep } => pkg::prune(&app, &name, keep),
        Command::Update { name } => pkg::update(&app, &name),
        Command::List => pkg::list(&app),
        Command::ListRemote { name } => pkg::list_remote(&app, &name),
        Command::Publish { spec, registry } => pkg::publish(&app, &spec, registry.as_deref()),
        Command::Embed { action } => embed::run(&app, action),
        Command::Pool { action } => pool::run(&app, action),
        Command::Benchmark(args) => benchmark::run(&app, args),
        Command::Plugins => plugins::run(&app),
        Command::Doctor => doctor::run(&app),
    };
    Ok(code)
}

fn feature_name(command: &Command) -> &'static str {
    match command {
        Command::Build { .. } => "build",
        Command::Query(_) => "query",
        Command::Replay { .. } => "replay",
        Command::Diff { .. } => "diff",
        Command::Install(_) => "install",
        Command::Uninstall { .. } => "uninstall",
        Command::Use { .. } => "use",
        Command::Prune { .. } => "prune",
        Command::Update { .. } => "update",
        Command::List => "list",
        Command::ListRemote { .. } => "list-remote",
        Command::Publish { .. } => "publish",
        Command::Embed { .. } => "embed",
        Command::Pool { .. } => "pool",
        Command::Benchmark(_) => "benchmark",
        Command::Plugins => "plugins",
        Command::Doctor => "doctor",
    }
}
