//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **NativeFunction / NativeCatalog**: ホストに組み込まれた関数（スレッドで隔離）
//! - **ProcessFunction / ProcessLoader**: フォルダ内の実行ファイル（プロセスで隔離）
//! - **LoaderChain**: 複数の CodeLoader を順に試す

pub mod chain;
pub mod native;
pub mod process;

pub use self::chain::LoaderChain;
pub use self::native::{NativeCatalog, NativeFunction, ThreadUnit};
pub use self::process::{ProcessFunction, ProcessLoader, ProcessUnit};
