//! HostBuilder - FunctionHost の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - build() 時に HostConfig を検証する
//! - 不正な設定は最初の登録より前に `HostConfig` エラーになる

use std::path::Path;
use std::sync::Arc;

use super::{Dispatcher, FunctionHost, Loader, LogStore, Registry, TriggerBus, WorkerHost};
use crate::config::HostConfig;
use crate::error::Result;
use crate::impls::{LoaderChain, NativeCatalog, ProcessLoader};
use crate::ports::{Clock, CodeLoader, FunctionCode, SystemClock, UlidGenerator};

/// Builds a [`FunctionHost`].
///
/// # 使用例
/// ```ignore
/// let host = HostBuilder::new()
///     .config(config)
///     .native("hello", NativeFunction::handler(|_e, _c| async move { Ok(Some(json!("hi"))) }))
///     .build()?;
/// ```
///
/// Code is looked up in the native catalog first, then by the process
/// loader (or the loader given to [`HostBuilder::code_loader`]).
pub struct HostBuilder {
    config: HostConfig,
    clock: Arc<dyn Clock>,
    catalog: NativeCatalog,
    code_loader: Option<Arc<dyn CodeLoader>>,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            config: HostConfig::default(),
            clock: Arc::new(SystemClock),
            catalog: NativeCatalog::new(),
            code_loader: None,
        }
    }

    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register an in-process function under a descriptor name or entry.
    pub fn native(mut self, key: impl Into<String>, code: impl FunctionCode + 'static) -> Self {
        self.catalog.insert(key, code);
        self
    }

    pub fn catalog(mut self, catalog: NativeCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Replace the process loader.
    pub fn code_loader(mut self, loader: Arc<dyn CodeLoader>) -> Self {
        self.code_loader = Some(loader);
        self
    }

    pub fn build(self) -> Result<FunctionHost> {
        let config = self.config;
        config.validate(Path::new("<host config>"))?;

        let fallback = match self.code_loader {
            Some(loader) => loader,
            None => {
                let mut process = ProcessLoader::new(config.default_entry.clone());
                for (extension, program) in &config.interpreters {
                    process = process.with_interpreter(extension.clone(), program.clone());
                }
                Arc::new(process)
            }
        };
        let mut chain = LoaderChain::new();
        if !self.catalog.is_empty() {
            chain.push(Arc::new(self.catalog));
        }
        chain.push(fallback);

        let registry = Arc::new(Registry::new());
        let logs = Arc::new(LogStore::new(self.clock.clone(), config.log_capacity));
        let bus = Arc::new(TriggerBus::new());
        let loader = Loader::new(
            registry.clone(),
            logs.clone(),
            bus.clone(),
            WorkerHost::new(config.worker_shutdown_grace()),
            Arc::new(chain),
            Arc::new(UlidGenerator::new(self.clock)),
            config.descriptor_file.clone(),
        );
        let dispatcher = Dispatcher::new(
            registry.clone(),
            config.not_found_message.clone(),
            config.http_timeout(),
        );

        Ok(FunctionHost::from_parts(
            config, registry, logs, bus, loader, dispatcher,
        ))
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}
