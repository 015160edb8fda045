/// HTTP Server Wiring (§6)
///
/// Builds the actix-web app serving both the verification-server endpoints
/// consumed by the STDIO proxy binary and the remote SSE/HTTP proxy
/// endpoints. Generalized from the teacher's single-route `run_server_http`.
use crate::bus::EventBus;
use crate::event::{EventType, MCPEvent, Producer, Task};
use crate::gatekeeper::{check_request, check_response, Verdict};
use crate::jrpc::Message;
use crate::journal::Journal;
use crate::notifier::Notifier;
use crate::state::Supervisor;
use crate::tools::ToolDescriptor;
use crate::transport::{http as http_transport, sse as sse_transport, ProxyContext};
use actix_web::{middleware::Logger, web, App, HttpRequest, HttpResponse, HttpServer};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct VerifyRequestBody {
    #[allow(dead_code)]
    app_name: String,
    server_name: String,
    stage: String,
    message: Value,
}

async fn verify_request(ctx: web::Data<ProxyContext>, body: web::Json<VerifyRequestBody>) -> HttpResponse {
    let Ok(message) = Message::from_value(body.message.clone()) else {
        return HttpResponse::BadRequest().json(serde_json::json!({ "allow": true, "reason": "malformed message" }));
    };

    let event_type = if body.stage == "pre_init" { EventType::Proxy } else { EventType::MCP };
    let event = MCPEvent::new(Producer::Local, event_type, body.server_name.clone(), Task::Send, message.clone());
    ctx.bus.dispatch_async(event);

    match check_request(&message) {
        Verdict::Allow => HttpResponse::Ok().json(serde_json::json!({ "allow": true })),
        Verdict::Block(reason) => HttpResponse::Ok().json(serde_json::json!({ "allow": false, "reason": reason })),
    }
}

async fn verify_response(ctx: web::Data<ProxyContext>, body: web::Json<VerifyRequestBody>) -> HttpResponse {
    let Ok(message) = Message::from_value(body.message.clone()) else {
        return HttpResponse::BadRequest().json(serde_json::json!({ "allow": true, "reason": "malformed message" }));
    };

    let event_type = if body.stage == "pre_init" { EventType::Proxy } else { EventType::MCP };
    let event = MCPEvent::new(Producer::Remote, event_type, body.server_name.clone(), Task::Recv, message.clone());
    if message.is_tools_list() {
        ctx.bus.dispatch_sync(event).await;
    } else {
        ctx.bus.dispatch_async(event);
    }

    match check_response(&message) {
        Verdict::Allow => HttpResponse::Ok().json(serde_json::json!({ "allow": true })),
        Verdict::Block(reason) => HttpResponse::Ok().json(serde_json::json!({ "allow": false, "reason": reason })),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterToolsBody {
    app_name: String,
    server_name: String,
    tools: Vec<ToolDescriptor>,
}

async fn register_tools(ctx: web::Data<ProxyContext>, body: web::Json<RegisterToolsBody>) -> HttpResponse {
    ctx.supervisor
        .set_catalog((body.app_name.clone(), body.server_name.clone()), body.tools.clone(), None);
    for tool in &body.tools {
        let _ = ctx
            .journal
            .upsert_tool_safety(body.server_name.clone(), body.app_name.clone(), tool.clone(), Some("safe".to_string()))
            .await;
    }
    HttpResponse::Ok().json(serde_json::json!({ "registered": body.tools.len() }))
}

#[derive(Debug, Deserialize)]
struct ToolsSafetyBody {
    mcp_tag: String,
}

async fn tools_safety(ctx: web::Data<ProxyContext>, body: web::Json<ToolsSafetyBody>) -> HttpResponse {
    let entry = ctx.supervisor.dangerous_for(&body.mcp_tag);
    HttpResponse::Ok().json(serde_json::json!({
        "tools": entry.tools,
        "filter_enabled": entry.filter_enabled,
    }))
}

async fn analysis_status(ctx: web::Data<ProxyContext>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "pending_calls": ctx.supervisor.pending_len(),
        "sse_connections": ctx.supervisor.sse_connection_count(),
        "shed_count": ctx.bus.shed_count(),
    }))
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok", "service": "mcp-guard" }))
}

async fn websocket_push(
    req: HttpRequest,
    body: web::Payload,
    notifier: web::Data<Notifier>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, mut session, _msg_stream) = actix_ws::handle(&req, body)?;
    let (id, mut rx) = notifier.subscribe();
    let notifier = notifier.get_ref().clone();

    actix_rt::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else { continue };
            if session.text(text).await.is_err() {
                break;
            }
        }
        notifier.unsubscribe(id);
        let _ = session.close(None).await;
    });

    Ok(response)
}

/// Build and run the proxy server, binding `host:port`. Runs until the
/// process receives a shutdown signal.
pub async fn run_server(host: String, port: u16, journal_path: String) -> std::io::Result<()> {
    let bind_addr = format!("{host}:{port}");

    let journal = Journal::open(&journal_path).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to open journal, falling back to in-memory");
        Journal::open_in_memory().expect("in-memory sqlite connection cannot fail to open")
    });

    let notifier = Notifier::new();

    let mut detectors: Vec<std::sync::Arc<dyn crate::bus::Detector>> = vec![
        std::sync::Arc::new(crate::detectors::command_injection::CommandInjectionDetector),
        std::sync::Arc::new(crate::detectors::filesystem_exposure::FilesystemExposureDetector),
        std::sync::Arc::new(crate::detectors::pii_leak::PiiLeakDetector::new(journal.clone())),
    ];

    let supervisor = Supervisor::new();

    if let Some(api_key) = crate::config::mistral_api_key() {
        let client = std::sync::Arc::new(crate::llm::MistralClient::new(api_key));
        let semantic_gap = crate::detectors::semantic_gap::SemanticGapDetector::new(
            client,
            supervisor.clone(),
            journal.clone(),
            crate::detectors::semantic_gap::ScoringMode::Int,
        )
        .with_notifier(notifier.clone());
        detectors.push(std::sync::Arc::new(semantic_gap));
    } else {
        tracing::warn!("MISTRAL_API_KEY not set, semantic-gap detector disabled");
    }

    let bus = std::sync::Arc::new(EventBus::new(journal.clone(), detectors).with_notifier(notifier.clone()));

    let ctx = ProxyContext {
        supervisor,
        bus,
        journal,
        notifier: notifier.clone(),
        http_client: reqwest::Client::new(),
        pending_call_max_age: Duration::from_secs(crate::config::pending_call_max_age_secs()),
    };

    let workers = std::env::var("WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| num_cpus::get().min(16).max(1));

    tracing::info!(%bind_addr, workers, "mcp-guard server starting");

    let ctx_data = web::Data::new(ctx);
    let notifier_data = web::Data::new(notifier);

    HttpServer::new(move || {
        App::new()
            .app_data(ctx_data.clone())
            .app_data(notifier_data.clone())
            .wrap(Logger::new("%r %s %Dms"))
            .route("/health", web::get().to(health))
            .route("/ws", web::get().to(websocket_push))
            .route("/verify/request", web::post().to(verify_request))
            .route("/verify/response", web::post().to(verify_response))
            .route("/register-tools", web::post().to(register_tools))
            .route("/tools/safety", web::post().to(tools_safety))
            .route("/analysis/status", web::get().to(analysis_status))
            .route("/{app}/{server}/message", web::post().to(sse_transport::handle_sse_post_message))
            .route("/{app}/{server}", web::get().to(sse_transport::handle_sse_get))
            .route("/{app}/{server}", web::post().to(http_transport::handle_http_proxy))
    })
    .workers(workers)
    .shutdown_timeout(10)
    .bind(&bind_addr)?
    .run()
    .await
}
