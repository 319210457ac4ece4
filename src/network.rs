use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use crate::aggregate::{LevelRow, LevelStats, MemoizedAggregator, commission_totals, level_data};
use crate::cache::{QueryCache, lock};
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::graph::{IntegrityIssue, ReferralGraph, ReferralNode};
use crate::guard::with_timeout;
use crate::source::{CommissionSource, GraphSource};
use crate::types::AffiliateId;

/// Everything the network page of one affiliate shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkReport {
    pub root: AffiliateId,
    pub stats: LevelStats,
    pub commission_totals: BTreeMap<u32, i64>,
    pub rows: Vec<LevelRow>,
    pub issues: Vec<IntegrityIssue>,
}

/// Fetches downstream networks once per staleness window and derives stats.
pub struct NetworkService {
    graphs: Arc<dyn GraphSource>,
    commissions: Arc<dyn CommissionSource>,
    settings: EngineSettings,
    cache: Mutex<QueryCache<AffiliateId, Arc<ReferralGraph>>>,
    memo: Mutex<MemoizedAggregator>,
}

impl NetworkService {
    pub fn new(
        graphs: Arc<dyn GraphSource>,
        commissions: Arc<dyn CommissionSource>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            graphs,
            commissions,
            settings,
            cache: Mutex::new(QueryCache::new(settings.staleness)),
            memo: Mutex::new(MemoizedAggregator::new()),
        }
    }

    pub async fn graph(&self, root: AffiliateId) -> Result<Arc<ReferralGraph>, EngineError> {
        let cached = lock(&self.cache).get_fresh(&root).cloned();
        if let Some(graph) = cached {
            return Ok(graph);
        }

        let payload = with_timeout(
            self.settings.fetch_timeout,
            self.graphs.downstream_network(root),
        )
        .await?;
        let graph = Arc::new(ReferralGraph::from_payload(root, payload));
        for issue in graph.issues() {
            warn!(root, %issue, "referral network integrity issue");
        }
        debug!(root, members = graph.len(), "referral network loaded");
        lock(&self.cache).insert(root, Arc::clone(&graph));
        Ok(graph)
    }

    pub async fn refresh(&self, root: AffiliateId) -> Result<Arc<ReferralGraph>, EngineError> {
        lock(&self.cache).invalidate(&root);
        self.graph(root).await
    }

    pub async fn level_stats(&self, root: AffiliateId) -> Result<LevelStats, EngineError> {
        let graph = self.graph(root).await?;
        Ok(lock(&self.memo).aggregate(&graph))
    }

    pub async fn level_data(
        &self,
        root: AffiliateId,
        level: u32,
    ) -> Result<Vec<ReferralNode>, EngineError> {
        let graph = self.graph(root).await?;
        Ok(level_data(&graph, level).into_iter().cloned().collect())
    }

    pub async fn report(&self, root: AffiliateId) -> Result<NetworkReport, EngineError> {
        let graph = self.graph(root).await?;
        let stats = lock(&self.memo).aggregate(&graph);
        let records = with_timeout(
            self.settings.fetch_timeout,
            self.commissions.commissions_for(root),
        )
        .await?;
        let totals = commission_totals(&records);
        Ok(NetworkReport {
            root,
            rows: stats.display_rows(&totals),
            stats,
            commission_totals: totals,
            issues: graph.issues().to_vec(),
        })
    }
}
