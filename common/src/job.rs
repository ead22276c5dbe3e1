use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::api::Split;
use crate::error::{NodeError, NodeResult};
use crate::ids::{AttemptId, JobId, NodeId, TaskId};
use crate::status::{Phase, PhasedStatus, State, Status};

/// Ruta dentro del sistema de archivos de un nodo concreto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualifiedPath {
    pub node: NodeId,
    pub path: String,
}

impl fmt::Display for QualifiedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.path)
    }
}

/// Descripción de un job leída del manifiesto del paquete ("jar").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub mapper: String,
    pub combiner: Option<String>,
    pub reducer: String,
    pub input_format: String,
    pub output_format: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Forma en disco del manifiesto; todos los campos opcionales para poder
/// reportar qué atributo falta.
#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(rename = "MapperClass")]
    mapper: Option<String>,
    #[serde(rename = "CombinerClass")]
    combiner: Option<String>,
    #[serde(rename = "ReducerClass")]
    reducer: Option<String>,
    #[serde(rename = "InputFormatClass")]
    input_format: Option<String>,
    #[serde(rename = "OutputFormatClass")]
    output_format: Option<String>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

fn required(value: Option<String>, attr: &str) -> NodeResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(NodeError::Descriptor(format!("falta el atributo {}", attr))),
    }
}

impl JobDescriptor {
    pub fn from_package(bytes: &[u8]) -> NodeResult<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| NodeError::Descriptor(format!("manifiesto ilegible: {e}")))?;
        Ok(Self {
            mapper: required(manifest.mapper, "MapperClass")?,
            combiner: manifest.combiner.filter(|c| !c.trim().is_empty()),
            reducer: required(manifest.reducer, "ReducerClass")?,
            input_format: required(manifest.input_format, "InputFormatClass")?,
            output_format: required(manifest.output_format, "OutputFormatClass")?,
            properties: manifest.properties,
        })
    }

    /// Serializa el descriptor como paquete, el inverso de `from_package`.
    pub fn to_package(&self) -> Vec<u8> {
        let mut manifest = serde_json::Map::new();
        manifest.insert("MapperClass".into(), self.mapper.clone().into());
        if let Some(ref c) = self.combiner {
            manifest.insert("CombinerClass".into(), c.clone().into());
        }
        manifest.insert("ReducerClass".into(), self.reducer.clone().into());
        manifest.insert("InputFormatClass".into(), self.input_format.clone().into());
        manifest.insert("OutputFormatClass".into(), self.output_format.clone().into());
        let props: serde_json::Map<String, serde_json::Value> = self
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into()))
            .collect();
        manifest.insert("properties".into(), props.into());
        serde_json::Value::Object(manifest).to_string().into_bytes()
    }
}

/// Snapshot de un attempt: lo único mutable de un attempt es su estado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptStatus {
    pub status: Status<AttemptId>,
    pub target: NodeId,
    pub message: Option<String>,
}

impl AttemptStatus {
    pub fn id(&self) -> AttemptId {
        *self.status.id()
    }

    pub fn task_id(&self) -> TaskId {
        self.status.id().task
    }

    pub fn state(&self) -> State {
        self.status.state()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: Status<TaskId>,
    /// Split de entrada (sólo tareas MAP).
    pub input_path: Option<String>,
    /// Salidas de todas las tareas MAP (sólo la tarea REDUCE).
    pub inputs: Vec<QualifiedPath>,
    pub attempts: Vec<AttemptStatus>,
}

impl TaskStatus {
    pub fn id(&self) -> TaskId {
        *self.status.id()
    }

    pub fn state(&self) -> State {
        self.status.state()
    }

    pub fn attempt(&self, seq: u32) -> Option<&AttemptStatus> {
        self.attempts.iter().find(|a| a.id().seq == seq)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: PhasedStatus<JobId>,
    pub map_tasks: Vec<TaskStatus>,
    pub reduce_tasks: Vec<TaskStatus>,
}

impl JobStatus {
    pub fn id(&self) -> JobId {
        *self.status.overall().id()
    }

    pub fn state(&self) -> State {
        self.status.state()
    }

    pub fn phase(&self) -> Phase {
        self.status.phase()
    }

    pub fn tasks(&self, phase: Phase) -> &[TaskStatus] {
        match phase {
            Phase::Map => &self.map_tasks,
            Phase::Reduce => &self.reduce_tasks,
        }
    }

    pub fn task(&self, seq: u32, map: bool) -> Option<&TaskStatus> {
        let phase = if map { Phase::Map } else { Phase::Reduce };
        self.tasks(phase).iter().find(|t| t.id().seq == seq)
    }
}

/// Entrada de un attempt según el tipo de tarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskInput {
    Map { split: Split, input_path: String },
    Reduce { inputs: Vec<QualifiedPath> },
}

/// Lo que el job manager envía a un task executor para ejecutar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorTask {
    pub attempt: AttemptId,
    pub target: NodeId,
    pub jar_path: String,
    pub output_path: String,
    pub input: TaskInput,
}

impl ExecutorTask {
    pub fn is_map(&self) -> bool {
        matches!(self.input, TaskInput::Map { .. })
    }
}
