//! Agent service assembly
//!
//! Builds the dependency-ordered construction graph: collaborator ports in,
//! price cache and gateway, stores, pattern engine, rebalancer, governor,
//! cognitive loop, and the scheduler driving it. No component holds a
//! back-reference to the loop; control and state queries go through the
//! [`AgentHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use config::AgentConfig;
use types::{Decision, Result};

use crate::cognition::CognitiveLoop;
use crate::control::{AgentSnapshot, ControlRequest};
use crate::gateway::MarketDataGateway;
use crate::governor::CostGovernor;
use crate::memory_store::MemoryStore;
use crate::patterns::PatternEngine;
use crate::ports::{Clock, DocStore, Executor, LanguageModel, MarketProvider, VectorIndex};
use crate::price_cache::PriceCache;
use crate::profile::PoolProfileStore;
use crate::rebalancer::Rebalancer;
use crate::scheduler::Scheduler;
use crate::stream::DecisionStream;

/// Control queue depth; commands are one-shot and drained every cycle.
const CONTROL_QUEUE: usize = 16;

/// Every external system the agent talks to, injected explicitly.
pub struct Collaborators {
    pub provider: Arc<dyn MarketProvider>,
    pub executor: Arc<dyn Executor>,
    pub vector_index: Arc<dyn VectorIndex>,
    pub doc_store: Arc<dyn DocStore>,
    pub llm: Option<Arc<dyn LanguageModel>>,
    pub clock: Arc<dyn Clock>,
}

/// Cloneable external surface: control input, state query, decision stream.
#[derive(Clone)]
pub struct AgentHandle {
    control: mpsc::Sender<ControlRequest>,
    cognition: Arc<CognitiveLoop>,
    stream: Arc<DecisionStream>,
}

impl AgentHandle {
    /// Enqueue a one-shot control command; applied at the next cycle start.
    pub async fn send_control(&self, request: ControlRequest) -> Result<()> {
        self.control
            .send(request)
            .await
            .map_err(|_| types::AgentError::Invariant("control channel closed".to_string()))
    }

    /// Consistent snapshot of agent state, last cycle, recent decisions,
    /// and active patterns.
    pub fn snapshot(&self) -> AgentSnapshot {
        self.cognition.snapshot()
    }

    /// Subscribe to the decision stream.
    pub fn subscribe_decisions(&self) -> broadcast::Receiver<Decision> {
        self.stream.subscribe()
    }
}

/// The assembled agent: cognitive loop plus its scheduler.
pub struct AgentService {
    cognition: Arc<CognitiveLoop>,
    scheduler: Scheduler,
    cancel: CancellationToken,
    handle: AgentHandle,
}

impl AgentService {
    pub fn new(config: AgentConfig, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let price_cache = Arc::new(PriceCache::new(config.stablecoins.iter().cloned()));
        let gateway = Arc::new(MarketDataGateway::new(
            collaborators.provider,
            price_cache.clone(),
            collaborators.clock.clone(),
            config.gateway.clone(),
            config.base_token_pools.clone(),
        ));

        let profiles = Arc::new(PoolProfileStore::new());
        let memory = Arc::new(MemoryStore::new(
            collaborators.vector_index,
            collaborators.doc_store.clone(),
            collaborators.clock.clone(),
        ));
        let patterns = Arc::new(PatternEngine::new(collaborators.clock.clone()));
        let governor = Arc::new(CostGovernor::new(
            config.daily_budget_usd,
            collaborators.clock.clone(),
        ));
        let rebalancer = Rebalancer::new(
            config.clone(),
            profiles.clone(),
            patterns.clone(),
            gateway.clone(),
            collaborators.llm,
        );
        let stream = Arc::new(DecisionStream::new());

        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);

        let cognition = Arc::new(CognitiveLoop::new(
            config.clone(),
            gateway,
            price_cache,
            profiles,
            memory,
            patterns,
            rebalancer,
            governor,
            collaborators.executor,
            collaborators.doc_store,
            collaborators.clock.clone(),
            stream.clone(),
            control_rx,
        ));

        let mut scheduler = Scheduler::new(collaborators.clock, cancel.clone());

        {
            let cognition = cognition.clone();
            let period_config = config.clone();
            let period_cognition = cognition.clone();
            scheduler.register_tick(
                "cycle",
                move || {
                    Duration::from_secs(
                        period_config.cycle_period_seconds_for(period_cognition.emergency()),
                    )
                },
                Box::new(move |cancel| {
                    let cognition = cognition.clone();
                    Box::pin(async move { cognition.run_cycle(cancel).await })
                }),
            );
        }

        {
            let cognition = cognition.clone();
            scheduler.register_tick(
                "profile-persistence",
                || Duration::from_secs(3600),
                Box::new(move |_cancel| {
                    let cognition = cognition.clone();
                    Box::pin(async move { cognition.run_hourly_maintenance().await })
                }),
            );
        }

        {
            let cognition = cognition.clone();
            scheduler.register_tick(
                "memory-prune",
                || Duration::from_secs(86_400),
                Box::new(move |_cancel| {
                    let cognition = cognition.clone();
                    Box::pin(async move { cognition.run_daily_maintenance().await })
                }),
            );
        }

        let handle = AgentHandle {
            control: control_tx,
            cognition: cognition.clone(),
            stream,
        };

        Self {
            cognition,
            scheduler,
            cancel,
            handle,
        }
    }

    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    /// Token that stops the scheduler at its next suspension point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Restore persisted state and drive the loop until shutdown.
    /// Returns the process exit code.
    pub async fn run(mut self) -> Result<i32> {
        self.cognition.init().await?;
        info!("agent service starting");
        let code = self.scheduler.run().await?;
        self.cognition.flush().await;
        Ok(code)
    }
}
