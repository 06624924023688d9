//! Collaborator traits: session lifecycle and per-target extraction.

use async_trait::async_trait;

use super::{ExtractError, ExtractionResult, Record};

/// Creates, probes, and tears down render sessions for the [`crate::core::ResourcePool`].
///
/// All methods are called from pool or worker threads and must not block
/// for long; `create` is the one allowed exception (launching a browser).
pub trait SessionFactory: Send + Sync + 'static {
    /// The stateful session type, e.g. a browser driver.
    type Session: Send + 'static;

    /// Launch a new session.
    ///
    /// # Errors
    ///
    /// Returns a description of why the session could not be started.
    fn create(&self) -> Result<Self::Session, String>;

    /// Cheap liveness check run before an idle session is handed out.
    fn probe(&self, session: &mut Self::Session) -> bool;

    /// Clear per-job state (cookies, storage) before the session goes back to
    /// the free list. Returning `false` retires the session instead.
    fn reset(&self, _session: &mut Self::Session) -> bool {
        true
    }

    /// Tear the session down. Must not panic; failures are the factory's to log.
    fn destroy(&self, session: Self::Session);
}

/// Site-specific extraction logic, the only call the engine makes into it.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_harvest::core::{ExtractError, ExtractionResult, Extractor};
///
/// #[derive(Clone)]
/// struct PlacePage;
///
/// #[async_trait]
/// impl Extractor<Browser, Poi> for PlacePage {
///     async fn extract(
///         &self,
///         target: &str,
///         session: &mut Browser,
///     ) -> Result<ExtractionResult<Poi>, ExtractError> {
///         let page = session.open(target).await.map_err(|e| ExtractError::Transport(e.to_string()))?;
///         let pois = page.pois();
///         if pois.is_empty() {
///             return Ok(ExtractionResult::EmptyRetryable);
///         }
///         Ok(ExtractionResult::Success(pois))
///     }
/// }
/// ```
#[async_trait]
pub trait Extractor<S, R>: Send + Sync + Clone + 'static
where
    S: Send + 'static,
    R: Record,
{
    /// Run one extraction against `target` using the borrowed session.
    ///
    /// The mapping from site-specific conditions to
    /// [`ExtractionResult::EmptyRetryable`] versus
    /// [`ExtractionResult::EmptyNoRetry`] is the implementor's policy.
    ///
    /// # Errors
    ///
    /// Any error marks the session as suspect; it is retired, not reused.
    async fn extract(&self, target: &str, session: &mut S)
        -> Result<ExtractionResult<R>, ExtractError>;
}
