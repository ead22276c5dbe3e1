//! Políticas intercambiables del job manager y del load balancer.
//!
//! Todas se eligen por nombre en la configuración del nodo (kebab-case).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::NodeError;
use crate::ids::NodeId;
use crate::job::{AttemptStatus, JobStatus, TaskStatus};
use crate::node_status::NodeStatus;
use crate::status::{Phase, State};

/// Puntaje de ocupación de un nodo (más alto = más ocupado).
pub fn compute_node_score(ns: &NodeStatus) -> f64 {
    let average = (ns.avg_cpu_utilization() + ns.throttle() + 1.0) * (ns.avg_queue_length() + 1.0);
    let last = (ns.cpu_utilization() + ns.throttle() + 1.0) * (ns.queue_length() as f64 + 1.0);
    (last + average) / 2.0
}

fn parse_policy<T>(s: &str, kind: &str) -> Result<T, NodeError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(serde_json::Value::String(s.trim().to_string()))
        .map_err(|_| NodeError::Config(format!("política {} desconocida: {}", kind, s)))
}

/// Elige el nodo destino de cada split al enviar un job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapPolicy {
    #[default]
    RoundRobin,
    Local,
}

impl BootstrapPolicy {
    pub fn select_node(
        &self,
        local: NodeId,
        split_seq: u32,
        node_ids: &[NodeId],
        _statuses: &BTreeMap<NodeId, NodeStatus>,
    ) -> NodeId {
        match self {
            BootstrapPolicy::RoundRobin if !node_ids.is_empty() => {
                node_ids[split_seq as usize % node_ids.len()]
            }
            _ => local,
        }
    }
}

impl FromStr for BootstrapPolicy {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_policy(s, "bootstrap")
    }
}

/// Decide si un heartbeat recibido amerita rebalancear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferPolicy {
    /// El nodo que reporta está ocioso y algún otro tiene cola.
    #[default]
    Idle,
    Never,
}

impl TransferPolicy {
    pub fn is_transfer_needed<'a, I>(&self, reporting: &NodeStatus, statuses: I) -> bool
    where
        I: IntoIterator<Item = &'a NodeStatus>,
    {
        match self {
            TransferPolicy::Never => false,
            TransferPolicy::Idle => {
                reporting.queue_length() == 0
                    && statuses.into_iter().any(|s| s.queue_length() > 0)
            }
        }
    }
}

impl FromStr for TransferPolicy {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_policy(s, "transfer")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelection {
    Busiest,
    Idlest,
}

impl NodeSelection {
    /// Ante empate gana el primero en orden de id.
    pub fn select_node<'a, I>(&self, statuses: I) -> Option<NodeId>
    where
        I: IntoIterator<Item = &'a NodeStatus>,
    {
        let mut best: Option<(NodeId, f64)> = None;
        for ns in statuses {
            let score = compute_node_score(ns);
            let better = match (self, best) {
                (_, None) => true,
                (NodeSelection::Busiest, Some((_, b))) => score > b,
                (NodeSelection::Idlest, Some((_, b))) => score < b,
            };
            if better {
                best = Some((ns.node_id(), score));
            }
        }
        best.map(|(id, _)| id)
    }
}

/// Elige origen y destino de una migración.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocationPolicy {
    #[default]
    ScoreBased,
}

impl LocationPolicy {
    pub fn source(&self) -> NodeSelection {
        match self {
            LocationPolicy::ScoreBased => NodeSelection::Busiest,
        }
    }

    pub fn target(&self) -> NodeSelection {
        match self {
            LocationPolicy::ScoreBased => NodeSelection::Idlest,
        }
    }
}

impl FromStr for LocationPolicy {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_policy(s, "location")
    }
}

/// Elige qué attempt migrar. Los reducers nunca se migran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Recorre del job y la tarea más nuevos a los más viejos.
    #[default]
    WaitingTask,
    /// Recorre del más viejo al más nuevo.
    FirstWaiting,
}

fn is_queued(state: State) -> bool {
    matches!(state, State::Created | State::Waiting)
}

/// Tiene un attempt vivo o exitoso en `target`: migrarla lo duplicaría.
fn is_on(task: &TaskStatus, target: NodeId) -> bool {
    task.attempts
        .iter()
        .any(|a| a.target == target && !matches!(a.state(), State::Failed | State::Canceled))
}

impl SelectionPolicy {
    pub fn select_attempt(
        &self,
        source: NodeId,
        target: NodeId,
        jobs: &[JobStatus],
    ) -> Option<AttemptStatus> {
        match self {
            SelectionPolicy::WaitingTask => {
                for job in jobs.iter().rev() {
                    for task in job.tasks(Phase::Map).iter().rev() {
                        if is_on(task, target) {
                            continue;
                        }
                        let candidate = task
                            .attempts
                            .iter()
                            .rev()
                            .find(|a| a.target == source && is_queued(a.state()));
                        if let Some(attempt) = candidate {
                            return Some(attempt.clone());
                        }
                    }
                }
                None
            }
            SelectionPolicy::FirstWaiting => jobs
                .iter()
                .flat_map(|job| job.tasks(Phase::Map))
                .filter(|task| !is_on(task, target))
                .flat_map(|task| task.attempts.iter())
                .find(|a| a.target == source && is_queued(a.state()))
                .cloned(),
        }
    }
}

impl FromStr for SelectionPolicy {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_policy(s, "selection")
    }
}
