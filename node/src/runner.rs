//! Ejecución de un attempt MAP o REDUCE.
//!
//! La E/S (paquete, split, salidas de los maps) es async; el código de usuario
//! corre en un hilo de bloqueo y revisa el flag de interrupción entre registros.

use anyhow::Result;
use common::api::{
    Context, InputFormat, Interrupted, Mapper, OutputFormat, PluginRegistry, Properties,
    RecordWriter, Reducer, Split,
};
use common::{ExecutorTask, JobDescriptor, QualifiedPath, TaskInput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::cluster::Cluster;
use crate::fs::LocalFileSystem;

type Grouped = BTreeMap<String, Vec<String>>;

/// Una línea de la salida de un map: clave y todos sus valores.
#[derive(Debug, Serialize, Deserialize)]
struct ShuffleRecord {
    k: String,
    v: Vec<String>,
}

fn check(interrupt: &AtomicBool) -> Result<()> {
    if interrupt.load(Ordering::Relaxed) {
        return Err(Interrupted.into());
    }
    Ok(())
}

pub(crate) async fn run(
    task: &ExecutorTask,
    fs: &LocalFileSystem,
    cluster: &Cluster,
    plugins: &PluginRegistry,
    interrupt: Arc<AtomicBool>,
) -> Result<()> {
    let descriptor = JobDescriptor::from_package(&fs.read(&task.jar_path).await?)?;
    match &task.input {
        TaskInput::Map { split, input_path } => {
            let data = fs.read(input_path).await?;
            let mapper = plugins.mapper(&descriptor.mapper)?;
            let combiner = match descriptor.combiner {
                Some(ref c) => Some(plugins.reducer(c)?),
                None => None,
            };
            let input_format = plugins.input_format(&descriptor.input_format)?;
            let split = *split;
            let output = tokio::task::spawn_blocking(move || {
                map_split(input_format, split, &data, mapper, combiner, &interrupt)
            })
            .await??;
            fs.write(&task.output_path, &output).await?;
        }
        TaskInput::Reduce { inputs } => {
            let merged = fetch_map_outputs(cluster, inputs, &interrupt).await?;
            let reducer = plugins.reducer(&descriptor.reducer)?;
            let output_format = plugins.output_format(&descriptor.output_format)?;
            let props = descriptor.properties.clone();
            let output = tokio::task::spawn_blocking(move || {
                reduce_all(merged, reducer, output_format, &props, &interrupt)
            })
            .await??;
            fs.write(&task.output_path, &output).await?;
        }
    }
    Ok(())
}

#[derive(Default)]
struct MapOutput(Grouped);

impl Context for MapOutput {
    fn write(&mut self, key: String, value: String) -> Result<()> {
        self.0.entry(key).or_default().push(value);
        Ok(())
    }
}

fn map_split(
    input_format: Arc<dyn InputFormat>,
    split: Split,
    data: &[u8],
    mut mapper: Box<dyn Mapper>,
    combiner: Option<Box<dyn Reducer>>,
    interrupt: &AtomicBool,
) -> Result<Vec<u8>> {
    let mut reader = input_format.record_reader(&split, data);
    let mut out = MapOutput::default();
    while let Some((key, value)) = reader.next_record()? {
        check(interrupt)?;
        mapper.map(&key, &value, &mut out)?;
    }
    let grouped = match combiner {
        Some(mut combiner) => {
            let mut combined = MapOutput::default();
            for (key, values) in &out.0 {
                check(interrupt)?;
                combiner.reduce(key, values, &mut combined)?;
            }
            combined.0
        }
        None => out.0,
    };
    encode(grouped)
}

fn encode(grouped: Grouped) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for (k, v) in grouped {
        serde_json::to_writer(&mut buf, &ShuffleRecord { k, v })?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn decode_into(bytes: &[u8], merged: &mut Grouped) -> Result<()> {
    for line in bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
        let record: ShuffleRecord = serde_json::from_slice(line)?;
        merged.entry(record.k).or_default().extend(record.v);
    }
    Ok(())
}

async fn fetch_map_outputs(
    cluster: &Cluster,
    inputs: &[QualifiedPath],
    interrupt: &AtomicBool,
) -> Result<Grouped> {
    let mut merged = Grouped::new();
    for input in inputs {
        check(interrupt)?;
        debug!("leyendo salida de map {}", input);
        let bytes = cluster.service(input.node)?.read(&input.path).await?;
        decode_into(&bytes, &mut merged)?;
    }
    Ok(merged)
}

struct WriterContext<'a> {
    writer: Box<dyn RecordWriter + 'a>,
}

impl Context for WriterContext<'_> {
    fn write(&mut self, key: String, value: String) -> Result<()> {
        self.writer.write(&key, &value)
    }
}

fn reduce_all(
    merged: Grouped,
    mut reducer: Box<dyn Reducer>,
    output_format: Arc<dyn OutputFormat>,
    props: &Properties,
    interrupt: &AtomicBool,
) -> Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    {
        let mut ctx = WriterContext {
            writer: output_format.record_writer(&mut buf, props),
        };
        for (key, values) in &merged {
            check(interrupt)?;
            reducer.reduce(key, values, &mut ctx)?;
        }
        ctx.writer.close()?;
    }
    Ok(buf)
}
