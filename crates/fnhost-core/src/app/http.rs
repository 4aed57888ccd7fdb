//! HTTP adapter: every GET goes to the Dispatcher.

use std::collections::BTreeMap;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

use super::FunctionHost;
use crate::domain::{Body, DispatchResponse, Event};

pub const METHOD_NOT_ALLOWED_MESSAGE: &str = "Error! Method not allowed!";

pub fn router(host: FunctionHost) -> Router {
    Router::new().fallback(handle).with_state(host)
}

async fn handle(
    State(host): State<FunctionHost>,
    method: Method,
    uri: Uri,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET {
        return (StatusCode::METHOD_NOT_ALLOWED, METHOD_NOT_ALLOWED_MESSAGE).into_response();
    }

    let mut event = Event::http(method.as_str(), uri.path()).with_query(query);
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            event = event.with_header(name.as_str(), value);
        }
    }
    into_response(host.dispatch(event).await)
}

fn into_response(dispatched: DispatchResponse) -> Response {
    let status = StatusCode::from_u16(dispatched.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = match dispatched.body {
        Some(Body::Text(text)) => {
            (status, [(CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response()
        }
        Some(Body::Json(value)) => (status, axum::Json(value)).into_response(),
        None => status.into_response(),
    };
    for (name, value) in dispatched.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => tracing::debug!(header = %name, "invalid response header dropped"),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::HostBuilder;
    use crate::config::HostConfig;
    use crate::impls::NativeFunction;
    use crate::ports::Context;
    use axum::body::{Body as HttpBody, to_bytes};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    async fn app() -> (Router, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        for (id, descriptor) in [
            ("hello", json!({ "name": "hello" })),
            ("data", json!({ "name": "data", "function": { "route": "/api/data" } })),
        ] {
            let dir = root.path().join(id);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("fnhost.json"), descriptor.to_string()).unwrap();
        }
        let host = HostBuilder::new()
            .config(HostConfig {
                root: root.path().to_path_buf(),
                ..HostConfig::default()
            })
            .native(
                "hello",
                NativeFunction::handler(|_e, _c| async move { Ok(Some(json!("hello world"))) }),
            )
            .native(
                "data",
                NativeFunction::handler(|event: Event, ctx: Context| async move {
                    ctx.reply.header("x-fn", "data");
                    Ok(Some(json!({
                        "q": event.query.get("q"),
                        "agent": event.headers.get("user-agent"),
                    })))
                }),
            )
            .build()
            .unwrap();
        host.load_all().await.unwrap();
        (router(host), root)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, HeaderMap, String) {
        let resp = router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .header("user-agent", "test")
                    .body(HttpBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn text_response() {
        let (router, _root) = app().await;
        let (status, headers, body) = get(router, "/hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello world");
        assert_eq!(headers[CONTENT_TYPE], "text/plain; charset=utf-8");
    }

    #[tokio::test]
    async fn json_response_with_query_and_headers() {
        let (router, _root) = app().await;
        let (status, headers, body) = get(router, "/api/data?q=rust").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-fn"], "data");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value, json!({ "q": "rust", "agent": "test" }));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let (router, _root) = app().await;
        let (status, _, body) = get(router, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Error! Function not found!");
    }

    #[tokio::test]
    async fn non_get_is_rejected() {
        let (router, _root) = app().await;
        let resp = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/hello")
                    .body(HttpBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
