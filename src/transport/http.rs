/// HTTP Transport Proxy (§4.5)
///
/// One POST endpoint per `(app, server)` for non-SSE MCP servers
/// (Context7-style). Stateless per message.
use crate::bus::EventBus;
use crate::event::{remote_mcp_tag, EventType, MCPEvent, Producer, Task};
use crate::gatekeeper::{block_response, check_request, check_response, Verdict};
use crate::jrpc::{strip_tool_call_reason, Message};
use crate::rewriter::rewrite_tools;
use crate::tools::ToolDescriptor;
use crate::transport::ProxyContext;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::Value;
use std::time::Duration;

const TARGET_TIMEOUT: Duration = Duration::from_secs(30);
const FORWARD_SKIP_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

fn resolve_target_url(req: &HttpRequest) -> Option<String> {
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("target=") {
                return Some(urlencoding_decode(value));
            }
        }
    }
    if let Some(header) = req.headers().get("X-MCP-Target-URL") {
        if let Ok(s) = header.to_str() {
            return Some(s.to_string());
        }
    }
    crate::config::target_url()
}

fn urlencoding_decode(raw: &str) -> String {
    raw.replace('+', " ").replace("%2F", "/").replace("%3A", ":")
}

pub async fn handle_http_proxy(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    body: web::Bytes,
    ctx: web::Data<ProxyContext>,
) -> HttpResponse {
    let (_app_name, server_name) = path.into_inner();

    let Some(target_url) = resolve_target_url(&req) else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "no target URL resolved (missing ?target=, X-MCP-Target-URL, or MCP_TARGET_URL)"
        }));
    };

    let message = match Message::parse(&String::from_utf8_lossy(&body)) {
        Ok(m) => m,
        Err(err) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("malformed JSON-RPC body: {err}")
            }))
        }
    };

    let mcp_tag = remote_mcp_tag(&target_url);

    let send_event = MCPEvent::new(Producer::Remote, EventType::MCP, mcp_tag.clone(), Task::Send, message.clone());
    ctx.bus.dispatch_async(send_event);

    if let Verdict::Block(reason) = check_request(&message) {
        if let Message::Request(r) = &message {
            let blocked = block_response(r.id.clone(), "Request", &reason, true);
            return HttpResponse::Ok().json(blocked);
        }
    }

    let mut outbound = message.to_value();
    if let Some(params) = outbound.get_mut("params") {
        strip_tool_call_reason(params);
    }

    let mut builder = ctx.http_client.post(&target_url).json(&outbound).timeout(TARGET_TIMEOUT);
    for (name, value) in req.headers() {
        let lower = name.as_str().to_lowercase();
        if FORWARD_SKIP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }

    let response = match builder.send().await {
        Ok(r) => r,
        Err(err) => {
            return HttpResponse::BadGateway().json(serde_json::json!({
                "error": format!("target unreachable: {err}")
            }))
        }
    };

    if !response.status().is_success() && response.status().as_u16() != 202 {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        return HttpResponse::build(actix_web::http::StatusCode::from_u16(status).unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY))
            .body(text);
    }

    if response.status().as_u16() == 202 {
        return HttpResponse::Accepted().finish();
    }

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let payload: Option<Value> = if content_type.contains("text/event-stream") {
        let text = response.text().await.unwrap_or_default();
        text.lines()
            .find_map(|line| line.strip_prefix("data:"))
            .and_then(|data| serde_json::from_str(data.trim()).ok())
    } else {
        response.json().await.ok()
    };

    let Some(payload) = payload else {
        return HttpResponse::BadGateway().json(serde_json::json!({ "error": "unparseable target response" }));
    };

    let recv_message = match Message::from_value(payload.clone()) {
        Ok(m) => m,
        Err(_) => return HttpResponse::Ok().json(payload),
    };

    let recv_event = MCPEvent::new(Producer::Remote, EventType::MCP, mcp_tag, Task::Recv, recv_message.clone());
    ctx.bus.dispatch_async(recv_event);

    let mut final_payload = payload;
    if recv_message.is_tools_list() {
        if let Some(tools_value) = final_payload.get("result").and_then(|r| r.get("tools")) {
            let tools = ToolDescriptor::parse_list(tools_value);
            let dangerous = ctx.supervisor.dangerous_for(&server_name);
            let rewritten = rewrite_tools(&tools, &dangerous.tools, dangerous.filter_enabled);
            if let Some(rewritten_value) = serde_json::to_value(rewritten).ok() {
                final_payload["result"]["tools"] = rewritten_value;
            }
        }
    } else if let Verdict::Block(reason) = check_response(&recv_message) {
        if let Message::Response(r) = &recv_message {
            let blocked = block_response(r.id.clone(), "Response", &reason, true);
            return HttpResponse::Ok().json(blocked);
        }
    }

    HttpResponse::Ok().json(final_payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_handles_common_escapes() {
        assert_eq!(urlencoding_decode("a%3A%2F%2Fb"), "a://b");
    }
}
