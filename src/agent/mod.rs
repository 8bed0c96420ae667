//! Agent HTTP server
//!
//! A thin remote-execution surface: `POST /run` takes JSON-encoded engine
//! params and answers with the JSON-encoded result, `GET /health` answers
//! 200. Each request gets a fresh engine, so the agent carries no state
//! between runs; engine failures map to 500 with the error text in the
//! body.

use crate::engine::{self, Params};
use crate::Result;
use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::path::PathBuf;
use tokio::net::TcpListener;

pub struct AgentServer {
    port: u16,
    /// When set, overrides the target path of every incoming request
    path_override: Option<PathBuf>,
}

impl AgentServer {
    pub fn new(port: u16, path_override: Option<PathBuf>) -> Self {
        Self {
            port,
            path_override,
        }
    }

    /// Bind and serve until the process exits
    pub fn serve(&self) -> Result<()> {
        let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
        let port = self.port;
        let path_override = self.path_override.clone();

        runtime.block_on(async move {
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("failed to bind port {}", port))?;
            println!("Jolt agent listening on :{}", port);

            loop {
                let (stream, _peer) = listener.accept().await.context("accept failed")?;
                let path_override = path_override.clone();
                tokio::spawn(async move {
                    let service =
                        service_fn(move |req| handle_request(req, path_override.clone()));
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        eprintln!("agent connection error: {}", err);
                    }
                });
            }
        })
    }
}

async fn handle_request(
    req: Request<Incoming>,
    path_override: Option<PathBuf>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => text_response(StatusCode::OK, "OK"),
        (&Method::POST, "/run") => match req.into_body().collect().await {
            Ok(body) => run_response(&body.to_bytes(), &path_override).await,
            Err(err) => text_response(StatusCode::BAD_REQUEST, &format!("invalid body: {}", err)),
        },
        (&Method::POST, _) | (&Method::GET, _) => {
            text_response(StatusCode::NOT_FOUND, "not found")
        }
        _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    };
    Ok(response)
}

async fn run_response(body: &[u8], path_override: &Option<PathBuf>) -> Response<Full<Bytes>> {
    let params: Params = match serde_json::from_slice(body) {
        Ok(params) => params,
        Err(err) => {
            return text_response(StatusCode::BAD_REQUEST, &format!("invalid params: {}", err))
        }
    };

    let path_override = path_override.clone();
    let outcome =
        tokio::task::spawn_blocking(move || execute_run(params, path_override.as_deref())).await;

    match outcome {
        Ok(Ok(json)) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .expect("static response construction cannot fail"),
        Ok(Err(err)) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("engine execution failed: {:#}", err),
        ),
        Err(err) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("engine task failed: {}", err),
        ),
    }
}

/// Decode-run-encode, blocking; shared by the handler and tests
fn execute_run(mut params: Params, path_override: Option<&std::path::Path>) -> Result<Vec<u8>> {
    if let Some(path) = path_override {
        params.path = path.to_path_buf();
    }
    let eng = engine::create(params.engine)?;
    let result = eng.run(&params)?;
    Ok(serde_json::to_vec(&result)?)
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("static response construction cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineKind, RunResult};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_execute_run_round_trip() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target.dat");
        std::fs::write(&target, vec![0u8; 1 << 20]).unwrap();

        let params = Params {
            engine: EngineKind::Sync,
            path: target,
            block_size: 4096,
            workers: 1,
            queue_depth: 1,
            min_runtime: Duration::from_millis(100),
            max_runtime: Duration::from_millis(200),
            error_target: 0.1,
            ..Params::default()
        };

        let json = execute_run(params, None).unwrap();
        let result: RunResult = serde_json::from_slice(&json).unwrap();
        assert!(result.total_ios > 0);
    }

    #[test]
    fn test_execute_run_applies_path_override() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("override.dat");
        std::fs::write(&target, vec![0u8; 1 << 20]).unwrap();

        let params = Params {
            engine: EngineKind::Sync,
            path: "/nonexistent/path".into(),
            block_size: 4096,
            workers: 1,
            queue_depth: 1,
            min_runtime: Duration::from_millis(100),
            max_runtime: Duration::from_millis(200),
            error_target: 0.1,
            ..Params::default()
        };

        let json = execute_run(params, Some(&target)).unwrap();
        let result: RunResult = serde_json::from_slice(&json).unwrap();
        assert!(result.total_ios > 0);
    }

    #[test]
    fn test_execute_run_engine_failure_is_error() {
        let params = Params {
            engine: EngineKind::Sync,
            path: "/nonexistent/path".into(),
            block_size: 4096,
            min_runtime: Duration::from_millis(50),
            max_runtime: Duration::from_millis(100),
            ..Params::default()
        };
        assert!(execute_run(params, None).is_err());
    }
}
