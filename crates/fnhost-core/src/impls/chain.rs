use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::Descriptor;
use crate::error::Result;
use crate::ports::{CodeLoader, FunctionCode};

/// Tries each loader in order; the first one that recognizes the folder wins.
#[derive(Clone, Default)]
pub struct LoaderChain {
    loaders: Vec<Arc<dyn CodeLoader>>,
}

impl LoaderChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, loader: impl CodeLoader + 'static) -> Self {
        self.loaders.push(Arc::new(loader));
        self
    }

    pub fn push(&mut self, loader: Arc<dyn CodeLoader>) {
        self.loaders.push(loader);
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

#[async_trait]
impl CodeLoader for LoaderChain {
    async fn load(
        &self,
        folder: &Path,
        descriptor: &Descriptor,
    ) -> Result<Option<Arc<dyn FunctionCode>>> {
        for loader in &self.loaders {
            if let Some(code) = loader.load(folder, descriptor).await? {
                return Ok(Some(code));
            }
        }
        Ok(None)
    }
}
