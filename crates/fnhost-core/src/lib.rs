//! fnhost-core
//!
//! Core building blocks for a lightweight function host: functions are
//! folders under a deployment root, each with a JSON descriptor and an
//! entry point, run as HTTP handlers, isolated workers or triggers.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（kind, descriptor, event, record, ids）
//! - **ports**: 抽象化レイヤー（FunctionCode, CodeLoader, ExecutionUnit, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（LogStore, TriggerBus, WorkerHost, Registry, Loader, Dispatcher, FunctionHost）
//! - **impls**: ports の実装（NativeFunction, ProcessFunction, LoaderChain）
//! - **config**: HostConfig（TOML）
//! - **error**: エラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use app::{FunctionHost, HostBuilder, router};
pub use config::HostConfig;
pub use error::{FnHostError, Result};
