use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::NodeError;

/// Separador entre niveles de un id calificado, ej: "00001-00003-mtask00002-attempt00001".
pub const SEP: char = '-';

/// Identificador de un nodo del cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Job creado por un nodo: (nodo dueño, secuencia).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub node: NodeId,
    pub seq: u32,
}

/// Tarea de un job. `map` distingue tareas MAP de la única REDUCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub job: JobId,
    pub seq: u32,
    pub map: bool,
}

/// Una ejecución concreta de una tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptId {
    pub task: TaskId,
    pub seq: u32,
}

impl NodeId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl JobId {
    pub fn new(node: NodeId, seq: u32) -> Self {
        Self { node, seq }
    }

    pub fn qualified(&self) -> String {
        format!("{}{}{}", self.node, SEP, self)
    }
}

impl TaskId {
    pub fn new(job: JobId, seq: u32, map: bool) -> Self {
        Self { job, seq, map }
    }

    pub fn node(&self) -> NodeId {
        self.job.node
    }

    pub fn qualified(&self) -> String {
        format!("{}{}{}", self.job.qualified(), SEP, self)
    }
}

impl AttemptId {
    pub fn new(task: TaskId, seq: u32) -> Self {
        Self { task, seq }
    }

    pub fn job(&self) -> JobId {
        self.task.job
    }

    /// Nodo cuyo job manager es dueño de este attempt.
    pub fn owner(&self) -> NodeId {
        self.task.job.node
    }

    pub fn qualified(&self) -> String {
        format!("{}{}{}", self.task.qualified(), SEP, self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.seq)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.map { 'm' } else { 'r' };
        write!(f, "{}task{:05}", kind, self.seq)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt{:05}", self.seq)
    }
}

fn parse_number(s: &str, whole: &str) -> Result<u32, NodeError> {
    s.parse::<u32>()
        .map_err(|_| NodeError::InvalidArgument(format!("id calificado inválido: {}", whole)))
}

fn split_levels(s: &str, expected: usize) -> Result<Vec<&str>, NodeError> {
    let parts: Vec<&str> = s.split(SEP).collect();
    if parts.len() != expected {
        return Err(NodeError::InvalidArgument(format!(
            "id calificado inválido: {} (se esperaban {} niveles)",
            s, expected
        )));
    }
    Ok(parts)
}

fn parse_task_segment(seg: &str, whole: &str) -> Result<(u32, bool), NodeError> {
    if let Some(rest) = seg.strip_prefix("mtask") {
        Ok((parse_number(rest, whole)?, true))
    } else if let Some(rest) = seg.strip_prefix("rtask") {
        Ok((parse_number(rest, whole)?, false))
    } else {
        Err(NodeError::InvalidArgument(format!(
            "id calificado inválido: {}",
            whole
        )))
    }
}

impl FromStr for NodeId {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(NodeId(parse_number(s, s)?))
    }
}

impl FromStr for JobId {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = split_levels(s, 2)?;
        Ok(JobId::new(
            NodeId(parse_number(parts[0], s)?),
            parse_number(parts[1], s)?,
        ))
    }
}

impl FromStr for TaskId {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = split_levels(s, 3)?;
        let job = JobId::new(
            NodeId(parse_number(parts[0], s)?),
            parse_number(parts[1], s)?,
        );
        let (seq, map) = parse_task_segment(parts[2], s)?;
        Ok(TaskId::new(job, seq, map))
    }
}

impl FromStr for AttemptId {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = split_levels(s, 4)?;
        let job = JobId::new(
            NodeId(parse_number(parts[0], s)?),
            parse_number(parts[1], s)?,
        );
        let (task_seq, map) = parse_task_segment(parts[2], s)?;
        let seq = parts[3]
            .strip_prefix("attempt")
            .ok_or_else(|| NodeError::InvalidArgument(format!("id calificado inválido: {}", s)))?;
        Ok(AttemptId::new(
            TaskId::new(job, task_seq, map),
            parse_number(seq, s)?,
        ))
    }
}
