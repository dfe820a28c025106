//! `cpm pool` - embedding pool server management.

use std::path::PathBuf;

use cpm_pool::types::PoolConfig;

use crate::app::CpmApp;
use crate::args::PoolAction;
use crate::output;

pub fn run(app: &CpmApp, action: PoolAction) -> i32 {
    match action {
        PoolAction::Serve { config, host, port } => serve(app, config, host, port),
        PoolAction::Status { url } => status(&url),
    }
}

fn serve(app: &CpmApp, config_path: Option<String>, host: Option<String>, port: Option<u16>) -> i32 {
    let mut config = match config_path {
        Some(path) => match PoolConfig::load(&PathBuf::from(path)) {
            Ok(config) => config,
            Err(e) => {
                output::error_line("pool", e.to_string(), None);
                return 1;
            }
        },
        None => {
            // Default into the workspace: pool.yml + cache under .cpm.
            let mut config = PoolConfig::default();
            config.pool_yml = app.layout.config_dir().join("pool.yml");
            config.cache_dir = app.layout.embeddings_cache_dir();
            config
        }
    };
    if let Some(host) = host {
        config.server_host = host;
    }
    if let Some(port) = port {
        config.server_port = port;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            output::error_line("pool", format!("runtime: {e}"), None);
            return 1;
        }
    };
    match runtime.block_on(cpm_pool::server::serve(config)) {
        Ok(()) => 0,
        Err(e) => {
            output::error_line("pool", e.to_string(), None);
            1
        }
    }
}

fn status(url: &str) -> i32 {
    let client = match reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            output::error_line("pool", e.to_string(), None);
            return 1;
        }
    };
    let endpoint = format!("{}/status", url.trim_end_matches('/'));
    match client.get(&endpoint).send() {
        Ok(response) => match response.json::<serde_json::Value>() {
            Ok(body) => {
                let _ = output::print_json(&body);
                0
            }
            Err(e) => {
                output::error_line("pool", format!("invalid status payload: {e}"), None);
                1
            }
        },
        Err(e) => {
            output::error_line(
                "pool",
                format!("pool unreachable at {url}: {e}"),
                Some("start it with `cpm pool serve`"),
            );
            1
        }
    }
}
