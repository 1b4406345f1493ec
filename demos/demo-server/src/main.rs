//! Demo server: one registry (greet, counter, audit.log, a lobby channel)
//! exposed over HTTP/SSE/JSON-RPC, WebSocket, TCP, and UDP.
//!
//! Exit codes: 0 on clean shutdown, 1 on bind failure, 2 on configuration
//! error.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};
use tracing::{error, info};

use raffel::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "demo-server", about = "Raffel demo server")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// URL prefix stripped uniformly from HTTP routes.
    #[arg(long)]
    base_path: Option<String>,
    /// Maximum accepted request body, in bytes.
    #[arg(long)]
    max_body_size: Option<usize>,
    /// TCP adapter port (HTTP port + 1 when omitted).
    #[arg(long)]
    tcp_port: Option<u16>,
    /// UDP adapter port (HTTP port + 2 when omitted).
    #[arg(long)]
    udp_port: Option<u16>,
}

fn build_registry() -> Result<Arc<Registry>, Error> {
    #[derive(serde::Deserialize, schemars::JsonSchema)]
    struct Greeting {
        name: String,
    }

    let registry = Arc::new(Registry::new());
    registry.procedure(
        HandlerDef::procedure("greet")
            .description("Greets the caller by name")
            .input_schema(schema_of::<Greeting>()),
        |input: Greeting, _ctx| async move {
            Ok(json!({ "message": format!("Hello, {}!", input.name) }))
        },
    )?;
    registry.stream(
        HandlerDef::stream("counter").description("Counts from 1 to `count`"),
        |input: Value, ctx| {
            let count = input.get("count").and_then(Value::as_u64).unwrap_or(0);
            let (producer, stream) = raffel::stream::producer(8);
            tokio::spawn(async move {
                for value in 1..=count {
                    if ctx.is_cancelled() {
                        break;
                    }
                    if producer.send(json!({ "value": value })).await.is_err() {
                        break;
                    }
                }
            });
            stream
        },
    )?;
    registry.event(
        HandlerDef::event("audit.log").description("Fire-and-forget audit sink"),
        |input: Value, _ctx| async move {
            info!(entry = %input, "audit");
            Ok(())
        },
    )?;
    Ok(registry)
}

async fn run(args: Args) -> Result<(), ExitCode> {
    let mut config = ServerConfig::from_env().map_err(|e| {
        error!("configuration error: {e}");
        ExitCode::from(2)
    })?;
    config.host = args.host;
    config.port = args.port;
    config.base_path = args.base_path;
    if let Some(max_body_size) = args.max_body_size {
        config.max_body_size = max_body_size;
    }

    let registry = build_registry().map_err(|e| {
        error!("registration failed: {e}");
        ExitCode::from(2)
    })?;
    let router = Arc::new(Router::new(registry));
    router.intercept(Arc::new(Logged::new()));
    router.intercept(Arc::new(Timed::threshold_warn(500)));

    let engine = Arc::new(ChannelEngine::new());
    engine
        .define(ChannelDef::presence("presence-lobby").authorize(|_ctx| async { true }))
        .and_then(|_| engine.define(ChannelDef::public("news")))
        .map_err(|e| {
            error!("channel registration failed: {e}");
            ExitCode::from(2)
        })?;

    let handle = ServerHandle::new(config.shutdown_grace);
    router.registry().freeze();

    // HTTP + SSE + JSON-RPC + WebSocket share one listener.
    let app = raffel::http::http_router(
        router.clone(),
        raffel::http::HttpConfig::from_server(&config),
        handle.token().clone(),
    )
    .merge(raffel::ws::ws_router(
        router.clone(),
        engine,
        WsConfig::default(),
        handle.token().clone(),
    ));

    let bind_failure = |e: std::io::Error, what: &str| {
        error!("failed to bind {what}: {e}");
        ExitCode::from(1)
    };

    let http_listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .map_err(|e| bind_failure(e, "http listener"))?;

    let tcp_port = args.tcp_port.unwrap_or(config.port + 1);
    let tcp_listener = tokio::net::TcpListener::bind((config.host.clone(), tcp_port))
        .await
        .map_err(|e| bind_failure(e, "tcp listener"))?;

    let udp_port = args.udp_port.unwrap_or(config.port + 2);
    let udp_socket = tokio::net::UdpSocket::bind((config.host.clone(), udp_port))
        .await
        .map_err(|e| bind_failure(e, "udp socket"))?;

    info!(
        http = %config.bind_addr(),
        tcp = tcp_port,
        udp = udp_port,
        "raffel demo server listening"
    );

    {
        let router = router.clone();
        let shutdown = handle.token().clone();
        handle.spawn_tracked(async move {
            if let Err(e) = serve_tcp(tcp_listener, router, TcpConfig::default(), shutdown).await {
                error!("tcp adapter failed: {e}");
            }
        });
    }
    {
        let router = router.clone();
        let shutdown = handle.token().clone();
        handle.spawn_tracked(async move {
            if let Err(e) = serve_udp(udp_socket, router, UdpConfig::default(), shutdown).await {
                error!("udp adapter failed: {e}");
            }
        });
    }

    // On signal: stop accepting and cancel every context; the drain below
    // waits out in-flight calls up to the grace period.
    let signal_token = handle.token().clone();
    let serve = axum::serve(http_listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });
    if let Err(e) = serve.await {
        error!("http server failed: {e}");
        return Err(ExitCode::from(1));
    }
    handle.shutdown().await;

    info!("raffel demo server stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}
