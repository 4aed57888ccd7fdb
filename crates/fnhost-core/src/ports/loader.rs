//! CodeLoader port - フォルダから関数コードを読み込む
//!
//! # 実装
//! - **ProcessLoader**: フォルダ内の実行ファイルを子プロセスとして動かす
//! - **NativeCatalog**: ホストに組み込まれた関数を名前で引く
//! - **LoaderChain**: 複数の loader を順に試す

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::FunctionCode;
use crate::domain::Descriptor;
use crate::error::Result;

/// Turns a function folder into loaded code.
#[async_trait]
pub trait CodeLoader: Send + Sync {
    /// `Ok(None)` means this loader does not recognize the folder; the
    /// caller may try another loader. Errors abort the registration.
    async fn load(
        &self,
        folder: &Path,
        descriptor: &Descriptor,
    ) -> Result<Option<Arc<dyn FunctionCode>>>;
}
