//! Load balancer: intercambio de heartbeats de carga y migración de attempts
//! del nodo más ocupado al más ocioso.

use common::node_status::NodeStatus;
use common::policy::{LocationPolicy, SelectionPolicy, TransferPolicy};
use common::{NodeId, NodeResult, NodeStatusSnapshot};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::cpu::CpuProbe;
use crate::executor::TaskExecutor;
use crate::job_manager::JobManager;

/// Políticas con que decide el load balancer.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalancePolicies {
    pub transfer: TransferPolicy,
    pub location: LocationPolicy,
    pub selection: SelectionPolicy,
}

pub struct LoadBalancer {
    cluster: Arc<Cluster>,
    executor: Arc<TaskExecutor>,
    jobs: Arc<JobManager>,
    cpu: Arc<dyn CpuProbe>,
    policies: BalancePolicies,
    statuses: Mutex<BTreeMap<NodeId, NodeStatus>>,
    ready: watch::Sender<bool>,
    transferring: AtomicBool,
}

/// Libera el flag de rebalanceo al salir, termine como termine.
struct TransferGuard(Arc<LoadBalancer>);

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.0.transferring.store(false, Ordering::Release);
    }
}

impl LoadBalancer {
    pub fn new(
        cluster: Arc<Cluster>,
        executor: Arc<TaskExecutor>,
        jobs: Arc<JobManager>,
        cpu: Arc<dyn CpuProbe>,
        policies: BalancePolicies,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            cluster,
            executor,
            jobs,
            cpu,
            policies,
            statuses: Mutex::new(BTreeMap::new()),
            ready,
            transferring: AtomicBool::new(false),
        }
    }

    fn statuses(&self) -> MutexGuard<'_, BTreeMap<NodeId, NodeStatus>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Vista actual de la carga de cada nodo escuchado.
    pub fn node_statuses(&self) -> BTreeMap<NodeId, NodeStatus> {
        self.statuses().clone()
    }

    /// Carga local en este instante.
    pub fn snapshot(&self) -> NodeStatusSnapshot {
        NodeStatusSnapshot {
            cpu_utilization: self.cpu.utilization(),
            queue_length: self.executor.queue_length() as u32,
            throttle: self.executor.throttle(),
            thread_count: self.executor.num_threads() as u32,
            active_thread_count: self.executor.active_count() as u32,
            ..NodeStatusSnapshot::new(self.cluster.local_id())
        }
    }

    /// Registra el heartbeat de un nodo y, si la política lo pide, lanza un
    /// rebalanceo en segundo plano.
    pub fn update_status(self: &Arc<Self>, snapshot: NodeStatusSnapshot) -> bool {
        let reporting = snapshot.node_id;
        let transfer_needed = {
            let mut guard = self.statuses();
            guard
                .entry(reporting)
                .or_insert_with(|| NodeStatus::new(reporting))
                .update(snapshot);

            if self.cluster.node_ids().iter().all(|id| guard.contains_key(id)) {
                self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
            }

            let statuses = &*guard;
            statuses.len() > 1
                && self
                    .policies
                    .transfer
                    .is_transfer_needed(&statuses[&reporting], statuses.values())
        };

        if transfer_needed {
            self.trigger_rebalance();
        }
        true
    }

    fn trigger_rebalance(self: &Arc<Self>) {
        if self
            .transferring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("ya hay un rebalanceo en curso");
            return;
        }
        let guard = TransferGuard(self.clone());
        tokio::spawn(async move {
            if let Err(e) = guard.0.rebalance().await {
                warn!("rebalanceo fallido: {}", e);
            }
            drop(guard);
        });
    }

    /// Migra un attempt si este nodo es el más ocupado. Devuelve si migró.
    pub async fn rebalance(&self) -> NodeResult<bool> {
        let (source, target) = {
            let statuses = self.statuses();
            (
                self.policies.location.source().select_node(statuses.values()),
                self.policies.location.target().select_node(statuses.values()),
            )
        };
        let (Some(source), Some(target)) = (source, target) else {
            return Ok(false);
        };
        if source != self.cluster.local_id() {
            return Ok(false);
        }
        if source == target {
            info!("origen y destino coinciden ({}), no se migra", source);
            return Ok(false);
        }

        let jobs = self.jobs.job_statuses();
        let Some(attempt) = self.policies.selection.select_attempt(source, target, &jobs) else {
            debug!("nada que migrar de {} a {}", source, target);
            return Ok(false);
        };
        self.jobs.migrate_task(target, &attempt).await?;
        Ok(true)
    }

    /// Envía la carga local a todos los nodos, incluido este.
    pub async fn push_status(&self) {
        let snapshot = self.snapshot();
        for &id in self.cluster.node_ids() {
            let result = match self.cluster.service(id) {
                Ok(svc) => svc.update_node_status(snapshot.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {}
                Err(e) if e.is_unreachable() => debug!("heartbeat a {} sin respuesta: {}", id, e),
                Err(e) => warn!("error enviando heartbeat a {}: {}", id, e),
            }
        }
    }

    pub async fn heartbeat_loop(self: Arc<Self>, interval: Duration) {
        loop {
            self.push_status().await;
            tokio::time::sleep(interval).await;
        }
    }

    /// Espera a haber escuchado al menos un heartbeat de cada nodo.
    pub async fn wait_until_ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|r| *r).await;
        info!("load balancer listo: todos los nodos reportaron");
    }
}
