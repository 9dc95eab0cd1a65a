//! Named samplers, created and updated by target name.
use crate::adaptive::{AdaptiveSampler, AdaptiveSamplerBuilder};
use crate::config::SamplerConfig;
use crate::error::{SamplerError, SamplerResult};
use opentelemetry::otel_warn;
use std::collections::HashMap;
use std::sync::RwLock;

/// Live samplers keyed by target, typically one per tracer provider or
/// service hosted in the process.
///
/// The registry is owned by the host. Nothing is global, and samplers are
/// only shut down when they are destroyed or the registry is shut down.
#[derive(Debug, Default)]
pub struct SamplerRegistry {
    samplers: RwLock<HashMap<String, AdaptiveSampler>>,
}

impl SamplerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        SamplerRegistry::default()
    }

    /// Builds a sampler for `target` and registers it.
    pub fn create(
        &self,
        target: impl Into<String>,
        builder: AdaptiveSamplerBuilder,
    ) -> SamplerResult<AdaptiveSampler> {
        let target = target.into();
        let mut samplers = self.samplers.write()?;
        if samplers.contains_key(&target) {
            return Err(SamplerError::TargetExists(target));
        }
        let sampler = builder.build();
        samplers.insert(target, sampler.clone());
        Ok(sampler)
    }

    /// The sampler registered for `target`.
    pub fn get(&self, target: &str) -> Option<AdaptiveSampler> {
        self.samplers.read().ok()?.get(target).cloned()
    }

    /// Targets with a registered sampler.
    pub fn targets(&self) -> Vec<String> {
        self.samplers
            .read()
            .map(|samplers| samplers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Publishes a new configuration to the sampler of `target`.
    pub fn update(&self, target: &str, config: SamplerConfig) -> SamplerResult<()> {
        let sampler = self
            .get(target)
            .ok_or_else(|| SamplerError::TargetNotFound(target.to_string()))?;
        sampler.update_config(config);
        Ok(())
    }

    /// Unregisters the sampler of `target` and shuts it down.
    pub fn destroy(&self, target: &str) -> SamplerResult<()> {
        let sampler = self
            .samplers
            .write()?
            .remove(target)
            .ok_or_else(|| SamplerError::TargetNotFound(target.to_string()))?;
        sampler.shutdown()
    }

    /// Unregisters and shuts down every sampler. Returns the first error after
    /// attempting all of them.
    pub fn shutdown(&self) -> SamplerResult<()> {
        let samplers: Vec<_> = self.samplers.write()?.drain().collect();
        let mut result = Ok(());
        for (target, sampler) in samplers {
            if let Err(err) = sampler.shutdown() {
                otel_warn!(
                    name: "AdaptiveSampler.Registry.ShutdownFailed",
                    target = target.as_str(),
                    error = err.to_string()
                );
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}
