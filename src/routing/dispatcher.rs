use crate::cache::RoutingCache;
use crate::config::RoutingConfig;
use crate::error::RoutingError;
use crate::metrics;
use crate::models::Extension;
use crate::routing::discovery::{prune, TreeDiscovery};
use crate::routing::{
    parse_symbolic, CallContext, RouteGenerator, RouteNode, RoutingResult, TreePath,
};
use crate::store::RoutingStore;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Stage-1 initial routing request.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub caller: String,
    pub called: String,
    /// Pre-assigned call id, e.g. the engine's billing id.
    pub call_id: Option<String>,
}

/// Result of a successful stage-1 request: the main result plus everything
/// the diagnostic endpoint wants to show.
pub struct RouteOutcome {
    pub call_id: String,
    pub result: RoutingResult,
    pub tree: RouteNode,
    pub cached: Vec<(TreePath, RoutingResult)>,
}

/// Diagnostic run: never writes the cache and keeps the tree around even
/// when route generation fails.
pub struct DiagnosticReport {
    pub tree: Option<RouteNode>,
    pub result: Option<RoutingResult>,
    pub all_results: Vec<(TreePath, RoutingResult)>,
    pub error: Option<RoutingError>,
}

/// Orchestrates one routing request: discovery, generation, cache writes.
/// Late-route lookups for symbolic inner-node names resolve directly from
/// the cache.
pub struct Dispatcher {
    store: Arc<dyn RoutingStore>,
    cache: Arc<dyn RoutingCache>,
    cfg: RoutingConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn RoutingStore>, cache: Arc<dyn RoutingCache>, cfg: RoutingConfig) -> Self {
        Self { store, cache, cfg }
    }

    pub async fn route(&self, request: RouteRequest) -> Result<RouteOutcome, RoutingError> {
        metrics::stage1::request();
        let started = Instant::now();
        let deadline = Duration::from_millis(self.cfg.request_timeout_ms);
        let result = match timeout(deadline, self.route_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(RoutingError::Timeout),
        };
        metrics::stage1::latency_seconds(started.elapsed().as_secs_f64());
        if let Err(err) = &result {
            metrics::stage1::failed(err.code());
        }
        result
    }

    async fn route_inner(&self, request: RouteRequest) -> Result<RouteOutcome, RoutingError> {
        debug!(caller = %request.caller, called = %request.called, "stage1 request received");
        let ctx = self.call_context(request).await?;

        // DISCOVERING
        let discovery = TreeDiscovery::new(self.store.as_ref(), self.cfg.forward_depth_limit);
        let mut outcome = discovery.discover(&ctx).await?;
        if !prune(&mut outcome.root) {
            return Err(RoutingError::NoRoute(format!(
                "all branches of {} pruned",
                ctx.called
            )));
        }

        // GENERATING
        let generator = RouteGenerator::new(&ctx, &self.cfg);
        let (result, cached) = generator.generate(&outcome.root)?;

        // CACHING: entries land atomically per key, none before this point.
        self.store_entries(&ctx.call_id, &cached).await?;

        // RESPONDED
        info!(
            call_id = %ctx.call_id,
            caller = %ctx.caller.number,
            called = %ctx.called,
            entries = cached.len(),
            fork = result.is_fork(),
            "stage1 routing responded"
        );
        Ok(RouteOutcome {
            call_id: ctx.call_id,
            result,
            tree: outcome.root,
            cached,
        })
    }

    /// Diagnostic variant used by the HTTP endpoint: same phases, no cache
    /// writes, partial tree on generation failure.
    pub async fn route_diagnostic(&self, request: RouteRequest) -> DiagnosticReport {
        let deadline = Duration::from_millis(self.cfg.request_timeout_ms);
        match timeout(deadline, self.diagnose(request)).await {
            Ok(report) => report,
            Err(_) => DiagnosticReport {
                tree: None,
                result: None,
                all_results: Vec::new(),
                error: Some(RoutingError::Timeout),
            },
        }
    }

    async fn diagnose(&self, request: RouteRequest) -> DiagnosticReport {
        let mut report = DiagnosticReport {
            tree: None,
            result: None,
            all_results: Vec::new(),
            error: None,
        };
        let ctx = match self.call_context(request).await {
            Ok(ctx) => ctx,
            Err(err) => {
                report.error = Some(err);
                return report;
            }
        };
        let discovery = TreeDiscovery::new(self.store.as_ref(), self.cfg.forward_depth_limit);
        let mut root = match discovery.discover(&ctx).await {
            Ok(outcome) => outcome.root,
            Err(err) => {
                report.error = Some(err);
                return report;
            }
        };
        if !prune(&mut root) {
            report.error = Some(RoutingError::NoRoute(format!(
                "all branches of {} pruned",
                ctx.called
            )));
            report.tree = Some(root);
            return report;
        }
        match RouteGenerator::new(&ctx, &self.cfg).generate(&root) {
            Ok((result, all_results)) => {
                report.result = Some(result);
                report.all_results = all_results;
            }
            Err(err) => report.error = Some(err),
        }
        report.tree = Some(root);
        report
    }

    /// Late-route lookup for a symbolic `stage1-<call-id>-<tree-path>` name.
    pub async fn lateroute(&self, name: &str) -> Result<RoutingResult, RoutingError> {
        let Some((call_id, tree_path)) = parse_symbolic(name) else {
            return Err(RoutingError::Gone(name.to_string()));
        };
        match self.cache.get(call_id, tree_path).await? {
            Some(bytes) => {
                metrics::stage1::lateroute_hit();
                let result = RoutingResult::from_bytes(&bytes)
                    .map_err(crate::cache::CacheError::Payload)?;
                Ok(result)
            }
            None => {
                metrics::stage1::lateroute_miss();
                debug!(call_id, tree_path, "late-route cache miss");
                Err(RoutingError::Gone(name.to_string()))
            }
        }
    }

    async fn call_context(&self, request: RouteRequest) -> Result<CallContext, RoutingError> {
        let caller = match self.store.extension_by_number(&request.caller).await? {
            Some(extension) => extension,
            None => Extension::external_placeholder(&request.caller),
        };
        Ok(CallContext::new(caller, request.called, request.call_id))
    }

    async fn store_entries(
        &self,
        call_id: &str,
        entries: &[(TreePath, RoutingResult)],
    ) -> Result<(), RoutingError> {
        if entries.is_empty() {
            return Ok(());
        }
        let ttl = Duration::from_secs(self.cfg.cache_ttl_secs);
        let result = try_join_all(entries.iter().map(|(path, result)| {
            let cache = self.cache.clone();
            async move {
                let bytes = result.to_bytes().map_err(crate::cache::CacheError::Payload)?;
                cache.put(call_id, path.as_str(), &bytes, ttl).await
            }
        }))
        .await;
        if let Err(err) = result {
            warn!(call_id, "cache write failed: {}", err);
            return Err(RoutingError::CacheUnavailable(err));
        }
        Ok(())
    }
}
