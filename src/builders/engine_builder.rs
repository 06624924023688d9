//! Builder to construct an [`Engine`] from configuration.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::engine::MetricsFactory;
use crate::core::{
    AdmissionController, CheckpointManager, Engine, EngineError, Extractor, FailureAggregator,
    MetricsSource, Record, ResourcePool, SessionFactory, SignatureFn,
};
use crate::infra::{DiagnosticLog, FileDiagnosticLog, SystemMetrics};
use crate::util::Shutdown;

/// Collects the engine's collaborators and overrides, then validates and
/// wires them in [`EngineBuilder::build`].
pub struct EngineBuilder<F, X> {
    config: EngineConfig,
    factory: Arc<F>,
    extractor: X,
    diagnostics: Option<Box<dyn DiagnosticLog>>,
    metrics: Option<MetricsFactory>,
    signature: Option<SignatureFn>,
    shutdown: Option<Shutdown>,
}

impl<F, X> EngineBuilder<F, X>
where
    F: SessionFactory,
{
    /// Start from a configuration and the two collaborators.
    #[must_use]
    pub fn new(config: EngineConfig, factory: F, extractor: X) -> Self {
        Self {
            config,
            factory: Arc::new(factory),
            extractor,
            diagnostics: None,
            metrics: None,
            signature: None,
            shutdown: None,
        }
    }

    /// Write failure reports somewhere other than `<diagnosticsDir>/diagnostics.jsonl`.
    #[must_use]
    pub fn diagnostic_log(mut self, log: Box<dyn DiagnosticLog>) -> Self {
        self.diagnostics = Some(log);
        self
    }

    /// Sample host load from something other than the local machine.
    #[must_use]
    pub fn metrics_source<M>(mut self, make: M) -> Self
    where
        M: Fn() -> Box<dyn MetricsSource> + Send + Sync + 'static,
    {
        self.metrics = Some(Box::new(make));
        self
    }

    /// Group failing inputs with a custom signature function.
    #[must_use]
    pub fn failure_signature(mut self, signature: SignatureFn) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Share an existing stop signal.
    #[must_use]
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Validate the configuration and build the engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for bad settings and
    /// [`EngineError::PersistenceFailure`] if the checkpoint or diagnostics
    /// directory cannot be created.
    pub fn build<R>(self) -> Result<Engine<F, X, R>, EngineError>
    where
        X: Extractor<F::Session, R>,
        R: Record,
    {
        self.config.validate().map_err(EngineError::InvalidConfig)?;

        let pool = Arc::new(ResourcePool::new(self.factory, self.config.pool_limits())?);
        let checkpoints = CheckpointManager::new(&self.config.checkpoint_dir)?;
        let log = match self.diagnostics {
            Some(log) => log,
            None => Box::new(FileDiagnosticLog::new(&self.config.diagnostics_dir)?),
        };
        let mut aggregator = FailureAggregator::new(
            uuid::Uuid::new_v4().to_string(),
            String::new(),
            self.config.failure_window_size,
            log,
        );
        if let Some(signature) = self.signature {
            aggregator = aggregator.with_signature(signature);
        }
        let metrics = self
            .metrics
            .unwrap_or_else(|| Box::new(|| Box::new(SystemMetrics::new()) as Box<dyn MetricsSource>));
        let admission = Arc::new(AdmissionController::new(self.config.watermarks()));

        Ok(Engine::from_parts(
            self.config,
            pool,
            self.extractor,
            checkpoints,
            admission,
            aggregator,
            metrics,
            self.shutdown.unwrap_or_default(),
        ))
    }
}
