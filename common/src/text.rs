//! Formatos de texto por línea.

use anyhow::Result;
use std::io::Write;

use crate::api::{
    InputFormat, OutputFormat, Properties, RecordReader, RecordWriter, Split, Splitter,
};

pub const LINES_PER_SPLIT: &str = "text.input.format.lines.per.split";
pub const LINES_PER_SPLIT_DEFAULT: u64 = 10_000;
pub const OUTPUT_SEPARATOR: &str = "text.output.format.separator";
pub const OUTPUT_SEPARATOR_DEFAULT: &str = ",";

/// Entrada de texto: cada registro es (número absoluto de línea, línea).
pub struct TextInputFormat;

impl InputFormat for TextInputFormat {
    fn splitter<'a>(&self, input: &'a [u8], props: &Properties) -> Result<Box<dyn Splitter + 'a>> {
        let lines_per_split = match props.get(LINES_PER_SPLIT) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| anyhow::anyhow!("{} inválido: {}", LINES_PER_SPLIT, raw))?,
            None => LINES_PER_SPLIT_DEFAULT,
        };
        Ok(Box::new(TextSplitter {
            rest: input,
            lines_per_split,
            line_number: 0,
            produced: 0,
        }))
    }

    fn record_reader<'a>(&self, split: &Split, data: &'a [u8]) -> Box<dyn RecordReader + 'a> {
        Box::new(LineRecordReader {
            rest: data,
            line_number: split.first_record,
        })
    }
}

/// Corta la próxima línea (con su '\n', si lo tiene) del frente de `rest`.
fn next_line<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    if rest.is_empty() {
        return None;
    }
    let end = rest
        .iter()
        .position(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(rest.len());
    let (line, tail) = rest.split_at(end);
    *rest = tail;
    Some(line)
}

struct TextSplitter<'a> {
    rest: &'a [u8],
    lines_per_split: u64,
    line_number: u64,
    produced: u32,
}

impl Splitter for TextSplitter<'_> {
    fn write_split(&mut self, out: &mut Vec<u8>) -> Result<Option<Split>> {
        let split = Split {
            first_record: self.line_number,
        };
        let mut written = 0;
        while written < self.lines_per_split {
            let Some(line) = next_line(&mut self.rest) else { break };
            out.extend_from_slice(line);
            if !line.ends_with(b"\n") {
                out.push(b'\n');
            }
            self.line_number += 1;
            written += 1;
        }
        if written == 0 && self.produced > 0 {
            return Ok(None);
        }
        self.produced += 1;
        Ok(Some(split))
    }
}

struct LineRecordReader<'a> {
    rest: &'a [u8],
    line_number: u64,
}

impl RecordReader for LineRecordReader<'_> {
    fn next_record(&mut self) -> Result<Option<(String, String)>> {
        let Some(raw) = next_line(&mut self.rest) else {
            return Ok(None);
        };
        self.line_number += 1;
        let line = std::str::from_utf8(raw)?
            .trim_end_matches('\n')
            .trim_end_matches('\r');
        Ok(Some((self.line_number.to_string(), line.to_string())))
    }
}

/// Salida de texto: una línea `clave<sep>valor` por registro.
pub struct TextOutputFormat;

impl OutputFormat for TextOutputFormat {
    fn record_writer<'a>(
        &self,
        out: &'a mut (dyn Write + Send),
        props: &Properties,
    ) -> Box<dyn RecordWriter + 'a> {
        let separator = props
            .get(OUTPUT_SEPARATOR)
            .cloned()
            .unwrap_or_else(|| OUTPUT_SEPARATOR_DEFAULT.to_string());
        Box::new(LineRecordWriter { out, separator })
    }
}

struct LineRecordWriter<'a> {
    out: &'a mut (dyn Write + Send),
    separator: String,
}

impl RecordWriter for LineRecordWriter<'_> {
    fn write(&mut self, key: &str, value: &str) -> Result<()> {
        writeln!(self.out, "{}{}{}", key, self.separator, value)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
