use std::path::{Path, PathBuf};

use async_trait::async_trait;
use piper_core::RenderedResource;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{LoadError, LoadResult, LoadSink};

const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Writes accepted documents as the members of one JSON array file.
///
/// Documents are buffered and written `buffer_size` at a time. The file is
/// created on the first write and the array closed by [`LoadSink::finish`];
/// a sink that never receives a document creates no file.
#[derive(Debug)]
pub struct JsonArrayFileSink {
    path: PathBuf,
    buffer_size: usize,
    state: Mutex<WriterState>,
}

#[derive(Debug, Default)]
struct WriterState {
    buffer: Vec<String>,
    file: Option<File>,
    written: usize,
    finished: bool,
}

impl JsonArrayFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_buffer_size(path, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(path: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            path: path.into(),
            buffer_size: buffer_size.max(1),
            state: Mutex::new(WriterState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, state: &mut WriterState) -> Result<(), LoadError> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        if state.file.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = File::create(&self.path).await?;
            file.write_all(b"[\n").await?;
            tracing::debug!(path = %self.path.display(), "Created JSON array output");
            state.file = Some(file);
        }

        let mut chunk = String::new();
        for doc in state.buffer.drain(..) {
            if state.written > 0 {
                chunk.push_str(",\n");
            }
            chunk.push_str(&doc);
            state.written += 1;
        }

        if let Some(file) = state.file.as_mut() {
            file.write_all(chunk.as_bytes()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LoadSink for JsonArrayFileSink {
    async fn load(&self, documents: &[RenderedResource]) -> Result<Vec<LoadResult>, LoadError> {
        let mut state = self.state.lock().await;
        if state.finished {
            return Err(LoadError::InvalidDestination(format!(
                "{} is already closed",
                self.path.display()
            )));
        }

        let mut results = Vec::with_capacity(documents.len());
        for resource in documents {
            let json = resource.to_json()?;
            state.buffer.push(serde_json::to_string(&json)?);
            results.push(LoadResult::accepted(resource.reference()));

            if state.buffer.len() >= self.buffer_size {
                self.flush(&mut state).await?;
            }
        }
        Ok(results)
    }

    async fn finish(&self) -> Result<(), LoadError> {
        let mut state = self.state.lock().await;
        if state.finished {
            return Ok(());
        }
        self.flush(&mut state).await?;
        state.finished = true;

        if let Some(mut file) = state.file.take() {
            file.write_all(b"\n]\n").await?;
            file.flush().await?;
            tracing::info!(
                path = %self.path.display(),
                documents = state.written,
                "JSON array output written"
            );
        }
        Ok(())
    }
}
