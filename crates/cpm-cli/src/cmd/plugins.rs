//! `cpm plugins` - list discovered plugins and their load state.

use cpm_plugins::PluginState;
use serde_json::json;

use crate::app::CpmApp;
use crate::output;

pub fn run(app: &CpmApp) -> i32 {
    if output::is_json() {
        let records: Vec<_> = app
            .plugins
            .iter()
            .map(|record| {
                json!({
                    "id": record.id,
                    "version": record.manifest.version,
                    "group": record.manifest.group,
                    "source": record.source.as_str(),
                    "state": match record.state {
                        PluginState::Pending => "pending",
                        PluginState::Ready => "ready",
                        PluginState::Failed => "failed",
                    },
                    "features": record.features,
                    "error": record.error,
                })
            })
            .collect();
        let _ = output::print_json(&records);
        return 0;
    }

    if app.plugins.is_empty() {
        output::line("plugins", "no plugins discovered");
    }
    for record in &app.plugins {
        let state = match record.state {
            PluginState::Pending => "pending",
            PluginState::Ready => "ready",
            PluginState::Failed => "failed",
        };
        let mut line = format!(
            "{} v{} [{}] state={state}",
            record.id,
            record.manifest.version,
            record.source.as_str()
        );
        if !record.features.is_empty() {
            line.push_str(&format!(" features={}", record.features.join(",")));
        }
        if let Some(error) = &record.error {
            line.push_str(&format!(" error={error}"));
        }
        output::line("plugins", line);
    }

    let features = app.registry.display_names();
    output::line("plugins", format!("features: {}", features.join(", ")));
    0
}
