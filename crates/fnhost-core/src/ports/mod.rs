//! Ports - 抽象化レイヤー
//!
//! 関数コードの読み込み方・実行のされ方はここの trait で隠蔽する。
//! host 側（app）はこれらの trait だけを見て動く。
//!
//! - **FunctionCode**: 読み込まれた関数（http handler / trigger initializer / worker entry）
//! - **CodeLoader**: フォルダから FunctionCode を作る
//! - **ExecutionUnit**: worker を隔離して動かす実行単位
//! - **Clock / IdGenerator**: テスト容易性のための差し替えポイント

pub mod clock;
pub mod code;
pub mod id_generator;
pub mod loader;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::code::{Context, ExecutionUnit, FnTeardown, FunctionCode, Teardown};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::loader::CodeLoader;
