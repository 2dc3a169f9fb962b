//! Clinical quality service
//!
//! Owns the long-lived pieces of a server session (pool registry, library
//! cache, retrieve translator) and exposes measure evaluation, retrieves and
//! bulk export on top of them.

use std::sync::Arc;

use octofhir_storage::{DynPool, InMemoryPool, PoolRegistry, PoolRegistryBuilder};
use serde_json::Value;

use crate::bulk_export::{BulkExportOutcome, BulkExportRequest, BulkExporter};
use crate::config::{CqfConfig, LoggingConfig};
use crate::data_provider::{RetrieveRequest, RetrieveTranslator};
use crate::date::{DateBoundaryResolver, FhirDateResolver};
use crate::engine::ExpressionEvaluator;
use crate::error::{CqfError, CqfResult};
use crate::library_cache::{
    CacheStats, CompiledLibrary, LibraryCache, LibraryCompiler, LibraryWriteThrough,
    VersionedLibraryId,
};
use crate::measure::MeasureReport;
use crate::measure_evaluator::{EvaluateMeasureRequest, MeasureEvaluator};
use crate::observability;
use crate::terminology_provider::{StoreTerminologyProvider, TerminologyProvider};

pub struct CqfService {
    pools: Arc<PoolRegistry>,
    libraries: Arc<LibraryCache>,
    translator: RetrieveTranslator,
    evaluator: MeasureEvaluator,
    exporter: BulkExporter,
    config: CqfConfig,
}

impl CqfService {
    pub fn builder(config: CqfConfig) -> CqfServiceBuilder {
        CqfServiceBuilder {
            config,
            pools: PoolRegistry::builder(),
            library_pool: None,
            terminology: None,
            dates: None,
            install_tracing: false,
        }
    }

    pub async fn evaluate_measure(
        &self,
        request: &EvaluateMeasureRequest,
    ) -> CqfResult<MeasureReport> {
        self.evaluator.evaluate_measure(request).await
    }

    pub async fn retrieve(&self, request: &RetrieveRequest) -> CqfResult<Vec<Value>> {
        self.translator.retrieve(request).await
    }

    pub async fn export_patient_data(
        &self,
        request: &BulkExportRequest,
    ) -> CqfResult<BulkExportOutcome> {
        tracing::info!(types = ?request.types, since = ?request.since, "Patient bulk export");
        self.exporter.export_patient_data(request).await
    }

    pub async fn export_group_data(
        &self,
        group_id: &str,
        request: &BulkExportRequest,
    ) -> CqfResult<BulkExportOutcome> {
        self.exporter.export_group_data(group_id, request).await
    }

    pub async fn resolve_library(
        &self,
        id: &VersionedLibraryId,
    ) -> CqfResult<Arc<CompiledLibrary>> {
        self.libraries.resolve(id).await
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    pub fn config(&self) -> &CqfConfig {
        &self.config
    }

    /// Applies a new `[logging]` section to the subscriber installed on build.
    /// Returns `false` when this service does not own the subscriber.
    pub fn apply_logging(&self, logging: &LoggingConfig) -> CqfResult<bool> {
        observability::apply_logging(logging)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.libraries.stats()
    }

    pub fn clear_cache(&self) {
        self.libraries.clear();
    }
}

pub struct CqfServiceBuilder {
    config: CqfConfig,
    pools: PoolRegistryBuilder,
    library_pool: Option<DynPool>,
    terminology: Option<Arc<dyn TerminologyProvider>>,
    dates: Option<Arc<dyn DateBoundaryResolver>>,
    install_tracing: bool,
}

impl CqfServiceBuilder {
    #[must_use]
    pub fn pool(mut self, pool: DynPool) -> Self {
        self.pools = self.pools.pool(pool);
        self
    }

    #[must_use]
    pub fn priority_pool(mut self, pool: DynPool) -> Self {
        self.pools = self.pools.priority_pool(pool);
        self
    }

    /// Backing store for Library resources. Writes through the registered
    /// Library pool recompile the cached library. Defaults to an in-memory pool.
    #[must_use]
    pub fn library_pool(mut self, pool: DynPool) -> Self {
        self.library_pool = Some(pool);
        self
    }

    /// Local terminology; defaults to the ValueSet and CodeSystem pools.
    #[must_use]
    pub fn terminology(mut self, terminology: Arc<dyn TerminologyProvider>) -> Self {
        self.terminology = Some(terminology);
        self
    }

    #[must_use]
    pub fn date_resolver(mut self, dates: Arc<dyn DateBoundaryResolver>) -> Self {
        self.dates = Some(dates);
        self
    }

    /// Installs the global log subscriber from `[logging]` on build.
    #[must_use]
    pub fn install_tracing(mut self) -> Self {
        self.install_tracing = true;
        self
    }

    pub fn build(
        self,
        compiler: Arc<dyn LibraryCompiler>,
        engine: Arc<dyn ExpressionEvaluator>,
    ) -> CqfResult<CqfService> {
        self.config.validate().map_err(CqfError::InvalidArgument)?;
        if self.install_tracing {
            observability::init_tracing(&self.config.logging)?;
        }

        let library_pool = self
            .library_pool
            .unwrap_or_else(|| Arc::new(InMemoryPool::new("Library")));
        if library_pool.resource_type() != "Library" {
            return Err(CqfError::InvalidArgument(format!(
                "Library pool serves {} resources",
                library_pool.resource_type()
            )));
        }

        let libraries = Arc::new(LibraryCache::new(library_pool.clone(), compiler));
        let pools = Arc::new(
            self.pools
                .priority_pool(Arc::new(LibraryWriteThrough::new(
                    library_pool,
                    libraries.clone(),
                )))
                .build(),
        );
        let dates = self.dates.unwrap_or_else(|| Arc::new(FhirDateResolver));
        let terminology = self
            .terminology
            .unwrap_or_else(|| Arc::new(StoreTerminologyProvider::new(pools.clone())));

        let translator =
            RetrieveTranslator::new(pools.clone(), terminology, dates.clone(), &self.config);
        let evaluator = MeasureEvaluator::new(
            pools.clone(),
            libraries.clone(),
            translator.clone(),
            dates.clone(),
            engine,
            &self.config,
        );
        let exporter = BulkExporter::new(pools.clone(), dates, &self.config.bulk_export);

        tracing::info!(
            resource_types = ?pools.resource_types(),
            max_retrieve_size = self.config.max_retrieve_size,
            failure_policy = ?self.config.failure_policy,
            "CQF service initialized"
        );

        Ok(CqfService {
            pools,
            libraries,
            translator,
            evaluator,
            exporter,
            config: self.config,
        })
    }
}
