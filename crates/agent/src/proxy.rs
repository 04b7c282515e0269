use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::AgentEvent;
use crate::credentials::upstream_client;
use crate::ops::Ops;
use crate::state::SharedState;
use crate::tokens::TokenParser;
use crate::{api, telemetry, SERVER_NAME};

const PARSER_CHANNEL_CAPACITY: usize = 64;
const BODY_CHANNEL_CAPACITY: usize = 16;
const RATE_TICK: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct ProxyContext {
    pub state: SharedState,
    pub ops: Arc<Ops>,
}

/// Every path is proxied; there are no local routes on this listener.
pub fn router(ctx: ProxyContext) -> Router {
    Router::new().fallback(proxy_handler).with_state(ctx)
}

async fn proxy_handler(State(ctx): State<ProxyContext>, req: Request) -> Response {
    let request_start = Instant::now();
    let timestamp = Utc::now();
    let request_id = Uuid::new_v4();
    let state = &ctx.state;

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let path_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| path.clone());

    debug!(%request_id, %method, %path, "request received");

    // Lazily boot the remote on first use, then block until it is ready.
    // A disconnecting caller cancels this future; there is nobody left to
    // answer, so the wait itself is the 503.
    ctx.ops.ensure_setup();
    state.gate.wait().await;

    let (mut tls, mut token) = match state.credentials.get().await {
        Ok(entry) => entry,
        Err(err) => {
            error!(%request_id, %err, "failed to load credentials");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to load certs: {err:#}"),
            )
                .into_response();
        }
    };

    // Buffer the body so retries can replay it, and peek at the model name
    // for the dashboard. Parse failures here are not fatal.
    let headers = scrub_headers(req.headers());
    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {err}"),
            )
                .into_response();
        }
    };
    let model = peek_model(&body);

    let retry_delay = Duration::from_secs(state.cfg.upstream_retry_delay_secs);
    let upstream_timeout = Duration::from_secs(state.cfg.upstream_timeout_secs);
    let max_attempts = state.cfg.upstream_retry_attempts.max(1);

    let Some(mut vm_ip) = state.cached_vm_ip() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "proxy not ready: no remote address".to_string(),
        )
            .into_response();
    };
    let mut client = match upstream_client(tls.clone(), &vm_ip, upstream_timeout) {
        Ok(client) => client,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to build upstream client: {err:#}"),
            )
                .into_response();
        }
    };

    let parser = Arc::new(TokenParser::new(&path));
    let mut upstream_response = None;

    for attempt in 0..max_attempts {
        let url = format!(
            "https://{SERVER_NAME}:{}{}",
            state.cfg.upstream_port, path_query
        );
        let request = client
            .request(method.clone(), &url)
            .headers(headers.clone())
            .header(header::HOST, SERVER_NAME)
            .bearer_auth(&token)
            .body(body.clone());

        parser.mark_upstream_start();
        match request.send().await {
            Ok(res) if res.status() == StatusCode::BAD_GATEWAY => {
                // The remote reverse proxy is up but the model runtime is
                // still loading.
                drop(res);
                warn!(%request_id, attempt, "upstream 502, model not ready yet");
                telemetry::record_upstream_retry("bad_gateway");
                if attempt + 1 == max_attempts {
                    return (
                        StatusCode::BAD_GATEWAY,
                        "model server not ready after retries".to_string(),
                    )
                        .into_response();
                }
                tokio::time::sleep(retry_delay).await;
            }
            Ok(res) => {
                upstream_response = Some(res);
                break;
            }
            Err(err) => {
                if is_impersonation(&err) {
                    // A mismatched pin is not transient; drop the cached
                    // material and force the next setup pass to sort it out.
                    error!(%request_id, %err, "server certificate failed the fingerprint pin");
                    state.credentials.invalidate().await;
                    ctx.ops.request_recovery();
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "server certificate fingerprint mismatch (possible impersonation)"
                            .to_string(),
                    )
                        .into_response();
                }
                warn!(%request_id, attempt, %err, "upstream request failed");
                telemetry::record_upstream_retry("transport");
                if attempt == 0 {
                    // First failure on a fresh path usually means the VM
                    // went away; hand the problem to the ops loop and wait
                    // for it to re-verify.
                    ctx.ops.request_recovery();
                    state.gate.wait().await;

                    match state.cached_vm_ip() {
                        Some(ip) => vm_ip = ip,
                        None => {
                            return (
                                StatusCode::SERVICE_UNAVAILABLE,
                                "proxy not ready after recovery".to_string(),
                            )
                                .into_response();
                        }
                    }
                    match state.credentials.get().await {
                        Ok(entry) => (tls, token) = entry,
                        Err(err) => {
                            return (
                                StatusCode::INTERNAL_SERVER_ERROR,
                                format!("failed to refresh certs: {err:#}"),
                            )
                                .into_response();
                        }
                    }
                    client = match upstream_client(tls.clone(), &vm_ip, upstream_timeout) {
                        Ok(client) => client,
                        Err(err) => {
                            return (
                                StatusCode::INTERNAL_SERVER_ERROR,
                                format!("failed to rebuild upstream client: {err:#}"),
                            )
                                .into_response();
                        }
                    };
                    continue;
                }
                if attempt + 1 == max_attempts {
                    return (
                        StatusCode::BAD_GATEWAY,
                        format!("failed to reach remote: {err}"),
                    )
                        .into_response();
                }
                tokio::time::sleep(retry_delay).await;
            }
        }
    }

    let Some(upstream) = upstream_response else {
        return (
            StatusCode::BAD_GATEWAY,
            "upstream retries exhausted".to_string(),
        )
            .into_response();
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    response_headers.remove(header::TRANSFER_ENCODING);
    response_headers.remove(header::CONNECTION);

    // Relay the body chunk by chunk, teeing each chunk into the parser over
    // a bounded channel so accounting stays off the write path.
    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(BODY_CHANNEL_CAPACITY);
    let (feed_tx, mut feed_rx) = mpsc::channel::<Bytes>(PARSER_CHANNEL_CAPACITY);

    let parser_task = {
        let parser = parser.clone();
        let state = state.clone();
        tokio::spawn(async move {
            while let Some(chunk) = feed_rx.recv().await {
                parser.feed(&chunk, &state.counters);
            }
        })
    };

    let rate_task = {
        let parser = parser.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RATE_TICK);
            loop {
                ticker.tick().await;
                let rate = parser.live_output_rate();
                if rate > 0.0 {
                    state.publish(AgentEvent::StreamingRate {
                        output_tok_per_sec: rate,
                    });
                }
            }
        })
    };

    let relay_task = tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        while let Some(next) = stream.next().await {
            match next {
                Ok(chunk) => {
                    if body_tx.send(Ok(chunk.clone())).await.is_err() {
                        debug!("client went away mid-stream");
                        break;
                    }
                    if feed_tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "upstream body read failed");
                    let _ = body_tx.send(Err(std::io::Error::other(err))).await;
                    break;
                }
            }
        }
    });

    // Finalize off the response path: wait for the stream and the parser to
    // drain, then publish the completed request.
    {
        let state = state.clone();
        let parser = parser.clone();
        let method = method.to_string();
        let path = path.clone();
        tokio::spawn(async move {
            let _ = relay_task.await;
            let _ = parser_task.await;
            rate_task.abort();

            state.touch_last_request();
            let (input_tokens, output_tokens) = parser.counts();
            let duration = request_start.elapsed();
            telemetry::record_proxy_request(status.as_u16(), duration);
            info!(
                %request_id,
                status = status.as_u16(),
                duration_ms = duration.as_millis() as u64,
                input_tokens,
                output_tokens,
                "request complete"
            );

            state.publish(AgentEvent::Request(api::RequestEvent {
                timestamp,
                method,
                path,
                model,
                status: status.as_u16(),
                duration_ms: duration.as_millis() as u64,
                encrypted: true,
                input_tokens,
                output_tokens,
                input_tok_per_sec: parser.input_rate(),
                output_tok_per_sec: parser.live_output_rate(),
            }));
        });
    }

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(body_rx)));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// Drops headers the proxy must not forward: the caller's authorization is
/// replaced with the internal bearer token, and host/length are recomputed
/// for the upstream connection.
fn scrub_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = inbound.clone();
    headers.remove(header::AUTHORIZATION);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers
}

/// Whether a transport failure was the pinning verifier rejecting the
/// server leaf, buried somewhere in the hyper/rustls error chain.
fn is_impersonation(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if current.to_string().contains("possible impersonation") {
            return true;
        }
        source = current.source();
    }
    false
}

/// Best-effort read of the top-level `"model"` field for dashboard display.
fn peek_model(body: &[u8]) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct Peek {
        model: String,
    }
    serde_json::from_slice::<Peek>(body)
        .ok()
        .map(|p| p.model)
        .filter(|m| !m.is_empty())
}
