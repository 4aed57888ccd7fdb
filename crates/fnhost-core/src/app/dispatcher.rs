//! Dispatcher - HTTP path → http 関数の呼び出し
//!
//! # 実装
//! 1. path（query 抜き）で Registry を完全一致検索
//! 2. record がない / kind が http でない → 404
//! 3. handler を別タスクで呼ぶ（panic はここで捕まえる）
//! 4. 失敗 → 500、タイムアウト → 504

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::Registry;
use crate::domain::{DispatchResponse, Event, FunctionKind};
use crate::error::{FnHostError, Result};
use crate::impls::native::panic_message;
use crate::ports::{Context, FunctionCode};

pub const FAILED_MESSAGE: &str = "Error! Function failed!";
pub const TIMED_OUT_MESSAGE: &str = "Error! Function timed out!";

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    not_found_message: String,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        not_found_message: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            not_found_message: not_found_message.into(),
            timeout,
        }
    }

    pub async fn dispatch(&self, event: Event) -> DispatchResponse {
        let path = event.path.as_deref().unwrap_or("/");
        let path = path.split('?').next().unwrap_or(path);

        let Some(record) = self
            .registry
            .get(path)
            .filter(|r| r.kind == FunctionKind::Http)
        else {
            tracing::debug!(path = %path, "no http function at path");
            return DispatchResponse::text(404, self.not_found_message.clone());
        };

        let ctx = record.context();
        let reply = ctx.reply.clone();
        match invoke_guarded(record.code.clone(), event, ctx, self.timeout).await {
            Ok(returned) => DispatchResponse::from_reply(returned, reply.snapshot()),
            Err(err) => {
                tracing::error!(name = %record.name, route = %record.route, error = %err, "dispatch failed");
                record.logger().error(&err);
                match err {
                    FnHostError::Timeout { .. } => DispatchResponse::text(504, TIMED_OUT_MESSAGE),
                    _ => DispatchResponse::text(500, FAILED_MESSAGE),
                }
            }
        }
    }
}

/// Run `code.handle` on its own task so a panic surfaces as a `HandlerFault`.
/// On timeout the task is aborted.
pub(crate) async fn invoke_guarded(
    code: Arc<dyn FunctionCode>,
    event: Event,
    ctx: Context,
    timeout: Option<Duration>,
) -> Result<Option<Value>> {
    let name = ctx.name.clone();
    let mut task = tokio::spawn(async move { code.handle(event, ctx).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(FnHostError::Timeout {
                    name,
                    limit_ms: limit.as_millis() as u64,
                });
            }
        },
        None => task.await,
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(FnHostError::fault(&name, panic_message(e.into_panic().as_ref()))),
        Err(e) => Err(FnHostError::fault(&name, e.to_string())),
    }
}
