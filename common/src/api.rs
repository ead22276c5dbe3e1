//! API de usuario: mappers, reducers y formatos de entrada/salida.
//!
//! Los jobs nombran cada pieza por su clave en un [`PluginRegistry`]; el
//! scheduler nunca depende de cómo se cargan.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;

use crate::error::{NodeError, NodeResult};
use crate::job::JobDescriptor;

pub type Properties = BTreeMap<String, String>;

/// Describe un split ya escrito: lo necesario para volver a leerlo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    /// Número absoluto del primer registro del split.
    pub first_record: u64,
}

/// El attempt observó un pedido de cancelación y cortó su ejecución.
#[derive(Debug, thiserror::Error)]
#[error("attempt interrumpido")]
pub struct Interrupted;

/// Destino de los pares clave/valor producidos por mappers y reducers.
pub trait Context {
    fn write(&mut self, key: String, value: String) -> Result<()>;
}

pub trait Mapper: Send {
    fn map(&mut self, key: &str, value: &str, ctx: &mut dyn Context) -> Result<()>;
}

pub trait Reducer: Send {
    fn reduce(&mut self, key: &str, values: &[String], ctx: &mut dyn Context) -> Result<()>;
}

/// Corta la entrada de un job en splits consecutivos.
pub trait Splitter: Send {
    /// Escribe el siguiente split en `out`. Devuelve `None` al llegar al fin de
    /// la entrada, pero nunca antes de haber producido al menos un split.
    fn write_split(&mut self, out: &mut Vec<u8>) -> Result<Option<Split>>;
}

pub trait RecordReader: Send {
    fn next_record(&mut self) -> Result<Option<(String, String)>>;
}

pub trait RecordWriter {
    fn write(&mut self, key: &str, value: &str) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait InputFormat: Send + Sync {
    fn splitter<'a>(&self, input: &'a [u8], props: &Properties) -> Result<Box<dyn Splitter + 'a>>;

    fn record_reader<'a>(&self, split: &Split, data: &'a [u8]) -> Box<dyn RecordReader + 'a>;
}

pub trait OutputFormat: Send + Sync {
    fn record_writer<'a>(
        &self,
        out: &'a mut (dyn Write + Send),
        props: &Properties,
    ) -> Box<dyn RecordWriter + 'a>;
}

type MapperFactory = Arc<dyn Fn() -> Box<dyn Mapper> + Send + Sync>;
type ReducerFactory = Arc<dyn Fn() -> Box<dyn Reducer> + Send + Sync>;

/// Registro de plugins por nombre. Se inyecta en el nodo al construirlo.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    mappers: HashMap<String, MapperFactory>,
    reducers: HashMap<String, ReducerFactory>,
    input_formats: HashMap<String, Arc<dyn InputFormat>>,
    output_formats: HashMap<String, Arc<dyn OutputFormat>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con los formatos `text` y el job `wordcount`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_input_format("text", crate::text::TextInputFormat);
        registry.register_output_format("text", crate::text::TextOutputFormat);
        registry.register_mapper("wordcount", || crate::wordcount::WordCountMapper);
        registry.register_reducer("wordcount", || crate::wordcount::WordCountReducer);
        registry
    }

    pub fn register_mapper<M, F>(&mut self, name: &str, factory: F)
    where
        M: Mapper + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        self.mappers.insert(
            name.to_string(),
            Arc::new(move || Box::new(factory()) as Box<dyn Mapper>),
        );
    }

    pub fn register_reducer<R, F>(&mut self, name: &str, factory: F)
    where
        R: Reducer + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.reducers.insert(
            name.to_string(),
            Arc::new(move || Box::new(factory()) as Box<dyn Reducer>),
        );
    }

    pub fn register_input_format<I: InputFormat + 'static>(&mut self, name: &str, format: I) {
        self.input_formats.insert(name.to_string(), Arc::new(format));
    }

    pub fn register_output_format<O: OutputFormat + 'static>(&mut self, name: &str, format: O) {
        self.output_formats.insert(name.to_string(), Arc::new(format));
    }

    pub fn mapper(&self, name: &str) -> NodeResult<Box<dyn Mapper>> {
        self.mappers
            .get(name)
            .map(|f| f())
            .ok_or_else(|| unknown("mapper", name))
    }

    /// Los combiners son reducers registrados con el mismo nombre.
    pub fn reducer(&self, name: &str) -> NodeResult<Box<dyn Reducer>> {
        self.reducers
            .get(name)
            .map(|f| f())
            .ok_or_else(|| unknown("reducer", name))
    }

    pub fn input_format(&self, name: &str) -> NodeResult<Arc<dyn InputFormat>> {
        self.input_formats
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("input format", name))
    }

    pub fn output_format(&self, name: &str) -> NodeResult<Arc<dyn OutputFormat>> {
        self.output_formats
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("output format", name))
    }

    /// Verifica que todas las piezas que nombra el descriptor existan.
    pub fn validate(&self, descriptor: &JobDescriptor) -> NodeResult<()> {
        self.mapper(&descriptor.mapper)?;
        if let Some(ref combiner) = descriptor.combiner {
            self.reducer(combiner)?;
        }
        self.reducer(&descriptor.reducer)?;
        self.input_format(&descriptor.input_format)?;
        self.output_format(&descriptor.output_format)?;
        Ok(())
    }
}

fn unknown(kind: &str, name: &str) -> NodeError {
    NodeError::Descriptor(format!("{} desconocido: {}", kind, name))
}
