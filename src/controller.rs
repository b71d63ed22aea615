//! Periodic driver over every runtime of the configured type.
//!
//! Each pass lists runtimes and runs one engine pass per runtime on its own
//! task, so different runtimes reconcile in parallel while a single runtime is
//! never driven twice at once. Engines outlive passes: a running metadata sync
//! and the failed-shutdown counter carry over to the next pass.
//!
//! Live runtimes get the controller's finalizer before they are reconciled, so
//! a deletion always surfaces as a deletion timestamp. Teardown and finalizer
//! removal run in the same task; the engine is dropped only once both succeed.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterError;
use crate::engine::{EngineContext, EngineError, EngineProfile, ReconcileOutcome, RuntimeEngine};

type RuntimeKey = (String, String);

/// Tally of one controller pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub ready: usize,
    pub progressing: usize,
    pub failed: usize,
    pub shut_down: usize,
}

enum PassResult {
    Reconciled(Result<ReconcileOutcome, EngineError>),
    Shutdown(Result<(), EngineError>),
}

pub struct Controller {
    ctx: EngineContext,
    profile: EngineProfile,
    namespace: Option<String>,
    engines: HashMap<RuntimeKey, RuntimeEngine>,
}

impl Controller {
    /// `namespace` limits the controller to one namespace; None watches all.
    pub fn new(ctx: EngineContext, profile: EngineProfile, namespace: Option<String>) -> Self {
        Self {
            ctx,
            profile,
            namespace,
            engines: HashMap::new(),
        }
    }

    /// Engines kept between passes.
    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    pub fn engine(&self, namespace: &str, name: &str) -> Option<&RuntimeEngine> {
        self.engines.get(&(namespace.to_string(), name.to_string()))
    }

    /// Run one engine pass for every runtime. Errors of individual runtimes are
    /// logged and counted; only failing to list runtimes fails the pass.
    pub async fn run_once(&mut self) -> Result<PassSummary, ClusterError> {
        let runtimes = self
            .ctx
            .cluster
            .list_runtimes(self.namespace.as_deref())
            .await?;

        let listed: HashSet<RuntimeKey> = runtimes
            .iter()
            .map(|rt| (rt.namespace().to_string(), rt.name().to_string()))
            .collect();
        self.engines.retain(|key, _| {
            let keep = listed.contains(key);
            if !keep {
                debug!(namespace = %key.0, runtime = %key.1, "runtime is gone, dropping engine");
            }
            keep
        });

        let mut tasks = JoinSet::new();
        for runtime in runtimes {
            let key = (runtime.namespace().to_string(), runtime.name().to_string());
            let mut engine = match self.engines.remove(&key) {
                Some(engine) => engine,
                None => RuntimeEngine::new(self.ctx.clone(), self.profile.clone(), &key.0, &key.1),
            };
            let deleting = runtime.is_deleting();
            tasks.spawn(async move {
                let result = if deleting {
                    let torn_down = async {
                        engine.shutdown().await?;
                        engine.complete_deletion().await
                    };
                    PassResult::Shutdown(torn_down.await)
                } else {
                    let reconciled = async {
                        engine.add_finalizer().await?;
                        engine.reconcile().await
                    };
                    PassResult::Reconciled(reconciled.await)
                };
                (key, engine, result)
            });
        }

        let mut summary = PassSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let (key, engine, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "runtime pass panicked");
                    summary.failed += 1;
                    continue;
                }
            };
            let (namespace, name) = (&key.0, &key.1);
            match result {
                PassResult::Reconciled(Ok(ReconcileOutcome::Ready)) => summary.ready += 1,
                PassResult::Reconciled(Ok(ReconcileOutcome::Progressing)) => {
                    summary.progressing += 1
                }
                PassResult::Reconciled(Err(e)) => {
                    warn!(namespace = %namespace, runtime = %name, error = %e, "reconcile failed");
                    summary.failed += 1;
                }
                PassResult::Shutdown(Ok(())) => {
                    info!(namespace = %namespace, runtime = %name, "runtime torn down");
                    summary.shut_down += 1;
                    continue;
                }
                PassResult::Shutdown(Err(e)) => {
                    warn!(namespace = %namespace, runtime = %name, attempts = engine.shutdown_attempts(), error = %e, "shutdown failed");
                    summary.failed += 1;
                }
            }
            self.engines.insert(key, engine);
        }
        Ok(summary)
    }

    /// Run passes every `period` until `shutdown` fires.
    pub async fn run(mut self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut resync = tokio::time::interval(period);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("controller shutting down");
                    break;
                }
                _ = resync.tick() => {
                    match self.run_once().await {
                        Ok(summary) => debug!(?summary, "controller pass finished"),
                        Err(e) => warn!(error = %e, "failed to list runtimes"),
                    }
                }
            }
        }
    }
}
