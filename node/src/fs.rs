use common::{NodeError, NodeResult};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Sistema de archivos de un nodo: rutas relativas bajo un directorio raíz.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rechaza rutas absolutas o que escapen de la raíz con `..`.
    pub fn resolve(&self, path: &str) -> NodeResult<PathBuf> {
        let rel = Path::new(path);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || !clean {
            return Err(NodeError::InvalidArgument(format!("ruta inválida: {}", path)));
        }
        Ok(self.root.join(rel))
    }

    pub async fn read(&self, path: &str) -> NodeResult<Vec<u8>> {
        let full = self.resolve(path)?;
        Ok(fs::read(full).await?)
    }

    /// Escribe el archivo completo, creando directorios intermedios.
    pub async fn write(&self, path: &str, data: &[u8]) -> NodeResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(full, data).await?;
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> NodeResult<()> {
        fs::create_dir_all(self.resolve(path)?).await?;
        Ok(())
    }

    pub async fn exists(&self, path: &str) -> NodeResult<bool> {
        Ok(fs::try_exists(self.resolve(path)?).await?)
    }

    /// Borra un archivo o un directorio entero. Devuelve false si no existía.
    pub async fn delete(&self, path: &str) -> NodeResult<bool> {
        let full = self.resolve(path)?;
        let meta = match fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(true)
    }
}
