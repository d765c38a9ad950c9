//! Model registry: public model id to provider binding.
//!
//! The whole table is swapped atomically on reload, so an in-flight request
//! keeps the binding it resolved and never observes a half-applied update.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::config::{Config, ProviderConfig};
use crate::error::AppError;
use crate::providers::ProviderFamily;

/// A credential that never shows up in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_empty() { "Secret(<none>)" } else { "Secret(***)" })
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PricingEntry {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl PricingEntry {
    /// `(cost_in, cost_out)` in USD.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> (f64, f64) {
        (
            f64::from(input_tokens) * self.input_per_million / 1_000_000.0,
            f64::from(output_tokens) * self.output_per_million / 1_000_000.0,
        )
    }
}

/// Everything needed to serve one public model id.
#[derive(Debug, Clone)]
pub struct ProviderBinding {
    /// Public id reported back to callers.
    pub model: String,
    pub upstream_model: String,
    pub provider: String,
    pub family: ProviderFamily,
    pub base_url: String,
    pub credential: Secret,
    pub headers: Vec<(String, String)>,
    pub pricing: PricingEntry,
    pub context_window: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub trim_history: bool,
    pub app_name: Option<String>,
    pub app_url: Option<String>,
    priority: i32,
}

impl ProviderBinding {
    /// A binding with defaults for everything but routing.
    pub fn new(
        model: impl Into<String>,
        family: ProviderFamily,
        base_url: impl Into<String>,
    ) -> Self {
        let model = model.into();
        Self {
            upstream_model: model.clone(),
            provider: family.as_str().to_string(),
            model,
            family,
            base_url: base_url.into(),
            credential: Secret::default(),
            headers: Vec::new(),
            pricing: PricingEntry::default(),
            context_window: None,
            max_output_tokens: None,
            trim_history: false,
            app_name: None,
            app_url: None,
            priority: 0,
        }
    }

    /// `base_url` joined with `path` without doubling the slash.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// One immutable snapshot of the registry.
#[derive(Debug, Default)]
pub struct RegistryTable {
    bindings: HashMap<String, Arc<ProviderBinding>>,
    /// Primary names in sorted order, for listing.
    listed: Vec<String>,
    pub generation: u64,
}

impl RegistryTable {
    /// Build a table from bindings and their aliases. On a name clash the
    /// higher provider priority wins; ties keep the first entry. Aliases
    /// never shadow a primary name.
    pub fn build(entries: Vec<(ProviderBinding, Vec<String>)>) -> Self {
        let mut primary: HashMap<String, Arc<ProviderBinding>> = HashMap::new();
        let mut aliases: Vec<(String, Arc<ProviderBinding>)> = Vec::new();

        for (binding, known_as) in entries {
            let binding = Arc::new(binding);
            let replace = match primary.get(&binding.model) {
                Some(existing) => binding.priority > existing.priority,
                None => true,
            };
            if replace {
                primary.insert(binding.model.clone(), Arc::clone(&binding));
            }
            aliases.extend(known_as.into_iter().map(|a| (a, Arc::clone(&binding))));
        }

        let mut listed: Vec<String> = primary.keys().cloned().collect();
        listed.sort();

        let mut bindings = primary;
        let mut alias_map: HashMap<String, Arc<ProviderBinding>> = HashMap::new();
        for (alias, binding) in aliases {
            if bindings.contains_key(&alias) {
                continue;
            }
            let replace = match alias_map.get(&alias) {
                Some(existing) => binding.priority > existing.priority,
                None => true,
            };
            if replace {
                alias_map.insert(alias, binding);
            }
        }
        bindings.extend(alias_map);

        Self {
            bindings,
            listed,
            generation: 0,
        }
    }

    pub fn get(&self, model: &str) -> Option<&Arc<ProviderBinding>> {
        self.bindings.get(model)
    }

    /// Primary bindings sorted by public id.
    pub fn models(&self) -> impl Iterator<Item = &Arc<ProviderBinding>> {
        self.listed.iter().filter_map(|name| self.bindings.get(name))
    }

    pub fn len(&self) -> usize {
        self.listed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listed.is_empty()
    }
}

/// Read-mostly registry shared by all requests.
#[derive(Debug)]
pub struct ModelRegistry {
    table: ArcSwap<RegistryTable>,
    generation: AtomicU64,
}

impl ModelRegistry {
    pub fn new(mut table: RegistryTable) -> Self {
        table.generation = 1;
        Self {
            table: ArcSwap::from_pointee(table),
            generation: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let table = bindings_from_config(config, |name| std::env::var(name).ok())?;
        let registry = Self::new(table);
        info!(
            generation = 1,
            models = registry.snapshot().len(),
            "Model registry loaded"
        );
        Ok(registry)
    }

    /// Exact-match lookup.
    pub fn resolve(&self, model: &str) -> Result<Arc<ProviderBinding>, AppError> {
        self.table
            .load()
            .get(model)
            .cloned()
            .ok_or_else(|| AppError::ModelNotFound(model.to_string()))
    }

    pub fn snapshot(&self) -> Arc<RegistryTable> {
        self.table.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replace the whole table. Returns the new generation.
    pub fn swap(&self, mut table: RegistryTable) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        table.generation = generation;
        self.table.store(Arc::new(table));
        generation
    }

    /// Re-read the config file and swap in its models. A failure leaves the
    /// current table in place.
    pub fn reload_from_path(&self, path: &Path) -> anyhow::Result<u64> {
        let config = Config::load(path)?;
        let table = bindings_from_config(&config, |name| std::env::var(name).ok())?;
        let models = table.len();
        let generation = self.swap(table);
        info!(generation, models, "Model registry reloaded");
        Ok(generation)
    }
}

/// Build a table from config, reading credentials through `env`.
pub fn bindings_from_config(
    config: &Config,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<RegistryTable> {
    config.validate()?;

    let providers: HashMap<&str, &ProviderConfig> =
        config.providers.iter().map(|p| (p.name.as_str(), p)).collect();

    let mut entries = Vec::with_capacity(config.models.len());
    for model in &config.models {
        let Some(provider) = providers.get(model.provider.as_str()) else {
            anyhow::bail!(
                "model '{}' references unknown provider '{}'",
                model.name,
                model.provider
            );
        };

        let credential = match &provider.api_key_env {
            Some(var) => match env(var).filter(|v| !v.trim().is_empty()) {
                Some(value) => Secret::new(value.trim()),
                None => {
                    warn!(
                        model = %model.name,
                        provider = %provider.name,
                        env = %var,
                        "Skipping model: provider credential not set"
                    );
                    continue;
                }
            },
            None => Secret::default(),
        };

        let binding = ProviderBinding {
            model: model.name.clone(),
            upstream_model: model.upstream_model.clone().unwrap_or_else(|| model.name.clone()),
            provider: provider.name.clone(),
            family: provider.family,
            base_url: provider.base_url.clone(),
            credential,
            headers: provider
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            pricing: PricingEntry {
                input_per_million: model.input_price,
                output_per_million: model.output_price,
            },
            context_window: model.context_window,
            max_output_tokens: model.max_output_tokens,
            trim_history: model.trim_history,
            app_name: provider.app_name.clone(),
            app_url: provider.app_url.clone(),
            priority: provider.priority,
        };
        entries.push((binding, model.known_as.clone()));
    }

    Ok(RegistryTable::build(entries))
}
