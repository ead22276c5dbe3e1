use anyhow::{Context as _, Result};

use crate::api::{Context, Mapper, Reducer};

/// Limpia un token: solo alfanumérico y '_', en minúscula.
pub fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase()
}

/// Emite (palabra, 1) por cada palabra de la línea.
pub struct WordCountMapper;

impl Mapper for WordCountMapper {
    fn map(&mut self, _key: &str, line: &str, ctx: &mut dyn Context) -> Result<()> {
        for raw in line.split_whitespace() {
            let cleaned = normalize_token(raw);
            if !cleaned.is_empty() {
                ctx.write(cleaned, "1".to_string())?;
            }
        }
        Ok(())
    }
}

/// Suma los conteos de cada palabra. Sirve también como combiner.
pub struct WordCountReducer;

impl Reducer for WordCountReducer {
    fn reduce(&mut self, word: &str, counts: &[String], ctx: &mut dyn Context) -> Result<()> {
        let mut total: u64 = 0;
        for c in counts {
            total += c
                .parse::<u64>()
                .with_context(|| format!("conteo inválido para '{}': {}", word, c))?;
        }
        ctx.write(word.to_string(), total.to_string())
    }
}
