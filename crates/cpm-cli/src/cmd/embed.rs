//! `cpm embed` - embedding provider management (`embeddings.yml`).

use crate::app::CpmApp;
use crate::args::EmbedAction;
use crate::config::{EmbeddingProvider, EmbeddingsConfig, ProviderAuth};
use crate::output;

pub fn run(app: &CpmApp, action: EmbedAction) -> i32 {
    match action {
        EmbedAction::Add {
            name,
            url,
            r#type,
            model,
            dims,
            batch_size,
            timeout,
            token,
            set_default,
        } => {
            let mut config = EmbeddingsConfig::load(&app.layout);
            let provider = EmbeddingProvider {
                r#type,
                url,
                model,
                dims,
                batch_size,
                timeout,
                auth: token.map(|token| ProviderAuth {
                    r#type: Some("bearer".to_string()),
                    token: Some(token),
                    username: None,
                    password: None,
                }),
                ..Default::default()
            };
            config.providers.insert(name.clone(), provider);
            if set_default || config.default.is_none() {
                config.default = Some(name.clone());
            }
            match config.save(&app.layout) {
                Ok(()) => {
                    output::line("embed", format!("provider '{name}' saved"));
                    0
                }
                Err(e) => {
                    output::error_line("embed", e.to_string(), None);
                    1
                }
            }
        }
        EmbedAction::List => {
            let config = EmbeddingsConfig::load(&app.layout);
            if config.providers.is_empty() {
                output::error_line(
                    "embed",
                    "no providers configured",
                    Some("configure an embedding provider with `cpm embed add <name> --url <url> --set-default`"),
                );
                return 1;
            }
            for (name, provider) in &config.providers {
                let marker = if config.default.as_deref() == Some(name) {
                    " (default)"
                } else {
                    ""
                };
                output::line(
                    "embed",
                    format!(
                        "{name}{marker} type={} url={} model={}",
                        provider.r#type,
                        provider.url,
                        provider.model.as_deref().unwrap_or("-")
                    ),
                );
            }
            0
        }
        EmbedAction::SetDefault { name } => {
            let mut config = EmbeddingsConfig::load(&app.layout);
            if !config.providers.contains_key(&name) {
                output::error_line("embed", format!("provider '{name}' is not configured"), None);
                return 1;
            }
            config.default = Some(name.clone());
            match config.save(&app.layout) {
                Ok(()) => {
                    output::line("embed", format!("default provider set to '{name}'"));
                    0
                }
                Err(e) => {
                    output::error_line("embed", e.to_string(), None);
                    1
                }
            }
        }
        EmbedAction::Remove { name } => {
            let mut config = EmbeddingsConfig::load(&app.layout);
            if config.providers.remove(&name).is_none() {
                output::error_line("embed", format!("provider '{name}' is not configured"), None);
                return 1;
            }
            if config.default.as_deref() == Some(name.as_str()) {
                config.default = config.providers.keys().next().cloned();
            }
            match config.save(&app.layout) {
                Ok(()) => {
                    output::line("embed", format!("provider '{name}' removed"));
                    0
                }
                Err(e) => {
                    output::error_line("embed", e.to_string(), None);
                    1
                }
            }
        }
    }
}
