use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::ids::NodeId;
use crate::status::now_millis;

/// Cantidad de heartbeats que se promedian por nodo.
pub const NODE_HEALTH_HISTORY: usize = 5;

/// Heartbeat de carga que un nodo envía a todos sus pares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusSnapshot {
    pub node_id: NodeId,
    pub cpu_utilization: f64,
    pub queue_length: u32,
    pub throttle: f64,
    pub thread_count: u32,
    pub active_thread_count: u32,
    pub taken_at: i64,
}

impl NodeStatusSnapshot {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            cpu_utilization: 0.0,
            queue_length: 0,
            throttle: 0.0,
            thread_count: 0,
            active_thread_count: 0,
            taken_at: now_millis(),
        }
    }
}

/// Vista local de la carga de un par: último valor y promedio de la ventana.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    node_id: NodeId,
    last: NodeStatusSnapshot,
    avg_cpu_utilization: f64,
    avg_queue_length: f64,
    history: VecDeque<NodeStatusSnapshot>,
}

impl NodeStatus {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            last: NodeStatusSnapshot::new(node_id),
            avg_cpu_utilization: 0.0,
            avg_queue_length: 0.0,
            history: VecDeque::with_capacity(NODE_HEALTH_HISTORY),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn cpu_utilization(&self) -> f64 {
        self.last.cpu_utilization
    }

    pub fn queue_length(&self) -> u32 {
        self.last.queue_length
    }

    pub fn throttle(&self) -> f64 {
        self.last.throttle
    }

    pub fn thread_count(&self) -> u32 {
        self.last.thread_count
    }

    pub fn active_thread_count(&self) -> u32 {
        self.last.active_thread_count
    }

    pub fn avg_cpu_utilization(&self) -> f64 {
        self.avg_cpu_utilization
    }

    pub fn avg_queue_length(&self) -> f64 {
        self.avg_queue_length
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }

    pub fn last(&self) -> &NodeStatusSnapshot {
        &self.last
    }

    /// Incorpora un heartbeat y recalcula los promedios de la ventana.
    pub fn update(&mut self, snapshot: NodeStatusSnapshot) {
        if self.history.len() == NODE_HEALTH_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(snapshot.clone());
        self.last = snapshot;

        let n = self.history.len() as f64;
        let (cpu, queue) = self.history.iter().fold((0.0, 0.0), |(c, q), s| {
            (c + s.cpu_utilization, q + s.queue_length as f64)
        });
        self.avg_cpu_utilization = cpu / n;
        self.avg_queue_length = queue / n;
    }
}
