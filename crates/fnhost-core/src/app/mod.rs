//! App - アプリケーション層
//!
//! ports を組み合わせて関数ホストを実装する。
//!
//! # 主要コンポーネント（葉から根へ）
//! - **LogStore**: 関数ごとの追記専用ログ
//! - **TriggerBus**: 名前をキーにした publish/subscribe
//! - **WorkerHost**: worker の実行単位の起動とメッセージ中継
//! - **Registry**: route → record、hot-swap の意味論
//! - **Loader**: フォルダ → record → 起動 → Registry
//! - **Dispatcher**: HTTP path → handler 呼び出し
//! - **FunctionHost / HostBuilder**: 公開 API とワイヤリング

pub mod builder;
pub mod dispatcher;
pub mod host;
pub mod http;
pub mod loader;
pub mod log_store;
pub mod registry;
pub mod trigger_bus;
pub mod worker_host;

// 主要な型を再エクスポート
pub use self::builder::HostBuilder;
pub use self::dispatcher::Dispatcher;
pub use self::host::FunctionHost;
pub use self::http::router;
pub use self::loader::Loader;
pub use self::log_store::{FunctionLog, LogEntry, LogStore, Logger};
pub use self::registry::Registry;
pub use self::trigger_bus::{Emitter, Listener, ListenerId, TriggerBus};
pub use self::worker_host::{WorkerHandle, WorkerHost, WorkerMessage, WorkerPort};
