/// SSE-Bidirectional Transport Proxy (§4.4)
///
/// Two HTTP endpoints per `(app, server)`: a long-lived SSE stream
/// (`GET /{app}/{server}`) and a POST message sink
/// (`POST /{app}/{server}/message`). The GET handler owns the single
/// outbound writer for its connection; the POST handler only ever enqueues
/// onto the bounded queue that writer drains.
use crate::event::{remote_mcp_tag, EventType, MCPEvent, Producer, Task};
use crate::gatekeeper::{block_response, check_response, Verdict};
use crate::jrpc::{strip_tool_call_reason, Message};
use crate::rewriter::rewrite_tools;
use crate::state::PendingCall;
use crate::tools::ToolDescriptor;
use crate::transport::ProxyContext;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use actix_web_lab::sse;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);
const ENDPOINT_WAIT: Duration = Duration::from_millis(1500);
const CHUNK_SIZE: usize = 4096;

fn forwarded_headers(req: &HttpRequest) -> HashMap<String, String> {
    req.headers()
        .iter()
        .filter(|(name, _)| {
            !matches!(
                name.as_str().to_lowercase().as_str(),
                "host" | "content-length" | "connection" | "accept" | "accept-encoding"
            )
        })
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect()
}

/// `GET /{app}/{server}`: opens the client-facing SSE stream.
pub async fn handle_sse_get(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    ctx: web::Data<ProxyContext>,
) -> HttpResponse {
    let (app_name, server_name) = path.into_inner();
    let Some(target_url) = crate::config::target_url() else {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": "no MCP_TARGET_URL configured" }));
    };
    let headers = forwarded_headers(&req);
    let connection_id = uuid::Uuid::new_v4().to_string();

    let (conn, outbound_rx) = ctx.supervisor.new_sse_connection(
        connection_id.clone(),
        server_name.clone(),
        app_name.clone(),
        target_url.clone(),
        headers.clone(),
    );

    let (sender, sse_stream) = sse::channel(64);

    let own_endpoint = format!("/{app_name}/{server_name}/message?connection={connection_id}");
    let _ = sender
        .send(sse::Event::Data(sse::Data::new(own_endpoint).event("endpoint")))
        .await;

    tokio::spawn(run_target_to_client(
        ctx.get_ref().clone(),
        conn.clone(),
        server_name.clone(),
        sender,
    ));
    tokio::spawn(run_client_to_target(ctx.get_ref().clone(), conn, server_name, outbound_rx));

    sse_stream.with_keep_alive(SSE_KEEPALIVE).respond_to(&req)
}

/// Background task: reads the target's own SSE stream and relays each event
/// to the client, rewriting `tools/list` results and gating tracked
/// responses along the way.
async fn run_target_to_client(
    ctx: ProxyContext,
    conn: std::sync::Arc<crate::state::SSEConnection>,
    mcp_tag: String,
    sender: sse::Sender,
) {
    let mut request = ctx.http_client.get(&conn.target_url).header("Accept", "text/event-stream");
    for (name, value) in &conn.forwarded_headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(err) => {
            warn!(error = %err, "target SSE stream unreachable");
            return;
        }
    };

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut endpoint_deadline = Instant::now() + ENDPOINT_WAIT;

    while let Some(chunk) = stream.next().await {
        let Ok(bytes) = chunk else { break };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = buffer.find("\n\n") {
            let raw_event = buffer[..pos].to_string();
            buffer.drain(..pos + 2);

            let (event_name, data_lines) = parse_sse_event(&raw_event);
            if event_name.as_deref() == Some("endpoint") {
                if let Some(data) = data_lines.first() {
                    *conn.target_message_endpoint.lock().unwrap() = Some(data.clone());
                }
                continue;
            }

            let data = data_lines.join("\n");
            if data.is_empty() {
                continue;
            }
            let Ok(message) = Message::parse(&data) else { continue };

            let recv_event = MCPEvent::new(Producer::Remote, EventType::MCP, mcp_tag.clone(), Task::Recv, message.clone());
            if message.is_tools_list() {
                ctx.bus.dispatch_sync(recv_event).await;
            } else {
                ctx.bus.dispatch_async(recv_event);
            }

            let mut outgoing = message.clone();
            if message.is_tools_list() {
                if let Message::Response(resp) = &message {
                    if let Some(tools_value) = resp.result.as_ref().and_then(|r| r.get("tools")) {
                        let tools = ToolDescriptor::parse_list(tools_value);
                        let dangerous = ctx.supervisor.dangerous_for(&mcp_tag);
                        let rewritten = rewrite_tools(&tools, &dangerous.tools, dangerous.filter_enabled);
                        let mut value = message.to_value();
                        value["result"]["tools"] = serde_json::json!(rewritten);
                        if let Ok(rewritten_msg) = Message::from_value(value) {
                            outgoing = rewritten_msg;
                        }
                    }
                }
            } else if let Message::Response(resp) = &message {
                let key = (conn.app_name.clone(), conn.server_name.clone(), resp.id.clone());
                if ctx.supervisor.take_pending(&key).is_some() {
                    if let Verdict::Block(reason) = check_response(&message) {
                        let blocked = block_response(resp.id.clone(), "Response", &reason, false);
                        outgoing = Message::Response(blocked);
                    }
                }
            }

            send_chunked(&sender, &outgoing.to_line()).await;
        }

        if Instant::now() > endpoint_deadline && conn.target_message_endpoint.lock().unwrap().is_none() {
            let fallback = format!("{}/message", conn.target_url.trim_end_matches('/'));
            *conn.target_message_endpoint.lock().unwrap() = Some(fallback);
            endpoint_deadline = Instant::now() + Duration::from_secs(3600);
        }
    }
}

fn parse_sse_event(raw: &str) -> (Option<String>, Vec<String>) {
    let mut event_name = None;
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim().to_string());
        }
    }
    (event_name, data_lines)
}

async fn send_chunked(sender: &sse::Sender, payload: &str) {
    for chunk in payload.as_bytes().chunks(CHUNK_SIZE) {
        let text = String::from_utf8_lossy(chunk).to_string();
        if sender.send(sse::Event::Data(sse::Data::new(text))).await.is_err() {
            break;
        }
    }
}

/// Background task: drains the bounded outbound queue filled by the POST
/// handler and relays each `tools/call` (and everything else) to the
/// captured target endpoint.
async fn run_client_to_target(
    ctx: ProxyContext,
    conn: std::sync::Arc<crate::state::SSEConnection>,
    mcp_tag: String,
    mut outbound_rx: tokio::sync::mpsc::Receiver<Value>,
) {
    while let Some(payload) = outbound_rx.recv().await {
        let Ok(message) = Message::from_value(payload.clone()) else {
            continue;
        };

        let send_event = MCPEvent::new(Producer::Remote, EventType::MCP, mcp_tag.clone(), Task::Send, message.clone());
        ctx.bus.dispatch_async(send_event);

        let mut outgoing = payload.clone();
        if let Some(params) = outgoing.get_mut("params") {
            strip_tool_call_reason(params);
        }

        if let Message::Request(req) = &message {
            if req.method == "tools/call" {
                let tool_name = req
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let key = (conn.app_name.clone(), conn.server_name.clone(), req.id.clone());
                ctx.supervisor.insert_pending(
                    key,
                    PendingCall {
                        tool_name,
                        arguments: req.params.as_ref().and_then(|p| p.get("arguments")).cloned().unwrap_or(Value::Null),
                        created_at: Instant::now(),
                    },
                );
            }
        }

        let endpoint = conn.target_message_endpoint.lock().unwrap().clone();
        let Some(endpoint) = endpoint else {
            warn!("no target message endpoint captured yet, dropping outbound message");
            continue;
        };
        let url = if endpoint.starts_with("http") {
            endpoint
        } else {
            format!("{}{}", base_url(&conn.target_url), endpoint)
        };

        match ctx.http_client.post(&url).json(&outgoing).send().await {
            Ok(resp) if resp.status().as_u16() == 202 => {}
            Ok(resp) if resp.status().is_success() => {
                // inline reply arrives via the SSE stream in practice; a
                // 200 with a JSON body is treated the same as a 202 here.
                let _ = resp.text().await;
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "target rejected forwarded message");
            }
            Err(err) => {
                warn!(error = %err, "failed to forward message to target");
            }
        }
    }
    ctx.supervisor.remove_sse_connection(&conn.id);
}

fn base_url(target_url: &str) -> String {
    if let Ok(url) = reqwest::Url::parse(target_url) {
        format!("{}://{}", url.scheme(), url.authority())
    } else {
        target_url.to_string()
    }
}

/// `POST /{app}/{server}/message`: enqueues one client→target message.
pub async fn handle_sse_post_message(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    body: web::Bytes,
    ctx: web::Data<ProxyContext>,
) -> HttpResponse {
    let (_app_name, server_name) = path.into_inner();
    let connection_id = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|p| p.strip_prefix("connection=")))
        .unwrap_or_default();

    let Some(conn) = ctx.supervisor.get_sse_connection(connection_id) else {
        return HttpResponse::NotFound().json(serde_json::json!({ "error": "unknown SSE connection" }));
    };
    let _ = server_name;

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => {
            return HttpResponse::BadRequest().json(serde_json::json!({ "error": format!("malformed body: {err}") }))
        }
    };

    match conn.outbound.try_send(payload) {
        Ok(()) => HttpResponse::Accepted().finish(),
        Err(_) => {
            ctx.bus.record_shed();
            HttpResponse::TooManyRequests().finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint_event() {
        let raw = "event:endpoint\ndata:/message?session=1";
        let (name, data) = parse_sse_event(raw);
        assert_eq!(name.as_deref(), Some("endpoint"));
        assert_eq!(data, vec!["/message?session=1".to_string()]);
    }

    #[test]
    fn parses_plain_data_event() {
        let raw = "data:{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}";
        let (name, data) = parse_sse_event(raw);
        assert!(name.is_none());
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn base_url_strips_path() {
        assert_eq!(base_url("https://example.com/mcp/sse"), "https://example.com");
    }
}
