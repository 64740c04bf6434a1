use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use chat_relay::config::{load_config, AppConfig, ServerConfig};
use chat_relay::observability::init_tracing;
use chat_relay::routing::{dispatch_request, normalize_base_path};
use chat_relay::state::AppState;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
#[cfg(unix)]
use socket2::{Domain, Protocol, Socket, Type};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_LISTEN_BACKLOG: i32 = 1024;

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration from '{config_path}': {e}");
        eprintln!("Copy 'config.example.yaml' to 'config.yaml' and adjust the upstream section.");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level);
    let runtime = build_runtime(&config.server);

    runtime.block_on(async move {
        run(config).await;
    });
}

fn build_runtime(server: &ServerConfig) -> tokio::runtime::Runtime {
    let worker_threads = server.runtime_worker_threads;
    let mut runtime_builder = if worker_threads == Some(1) {
        tokio::runtime::Builder::new_current_thread()
    } else {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if let Some(threads) = worker_threads {
            builder.worker_threads(threads);
        }
        builder
    };
    runtime_builder.enable_io();
    runtime_builder.enable_time();
    if let Some(max_blocking_threads) = server.runtime_max_blocking_threads {
        runtime_builder.max_blocking_threads(max_blocking_threads);
    }
    runtime_builder.build().unwrap_or_else(|e| {
        eprintln!("Failed to initialize Tokio runtime: {e}");
        std::process::exit(1);
    })
}

async fn run(config: AppConfig) {
    let host = config.server.host.clone();
    let port = config.server.port;
    let base_path = normalize_base_path(&config.server.base_path);

    let state = match AppState::from_config(config) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            eprintln!("Failed to prepare upstream client: {err}");
            std::process::exit(1);
        }
    };
    if !state.has_upstream_credential() {
        tracing::warn!(
            api_key_env = %state.config.upstream.api_key_env,
            "no upstream credential configured; stream requests will be rejected until one is set"
        );
    }

    let listeners = build_server_listeners(&state.config.server, &host, port)
        .await
        .unwrap_or_else(|err| {
            eprintln!("Failed to bind to {host}:{port}: {err}");
            std::process::exit(1);
        });

    tracing::info!(
        %host,
        port,
        base_path = %base_path,
        upstream = %state.upstream.host(),
        model = %state.upstream.model(),
        listeners = listeners.len(),
        "chat-relay ready to accept connections"
    );

    let base_path = Arc::<str>::from(base_path);
    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    let mut accept_loops = listeners.into_iter().map(|listener| {
        serve_accept_loop(
            listener,
            conn_builder.clone(),
            Arc::clone(&state),
            Arc::clone(&base_path),
        )
    });

    let Some(first) = accept_loops.next() else {
        return;
    };
    for accept_loop in accept_loops {
        tokio::spawn(accept_loop);
    }
    first.await;
}

async fn serve_accept_loop(
    listener: tokio::net::TcpListener,
    conn_builder: AutoBuilder<TokioExecutor>,
    state: Arc<AppState>,
    base_path: Arc<str>,
) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("failed to enable TCP_NODELAY for {remote_addr}: {err}");
        }

        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let request_state = Arc::clone(&state);
        let request_base_path = Arc::clone(&base_path);
        let hyper_service = service_fn(move |request: Request<Incoming>| {
            dispatch_request(
                Arc::clone(&request_state),
                Arc::clone(&request_base_path),
                request.map(Body::new),
            )
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, hyper_service).await {
                tracing::debug!("connection from {remote_addr} ended with error: {err:#}");
            }
        });
    }
}

async fn build_server_listeners(
    server: &ServerConfig,
    host: &str,
    port: u16,
) -> io::Result<Vec<tokio::net::TcpListener>> {
    let mut listener_count = server.tcp_reuse_port_listener_count.map_or(1, |n| n.max(1));
    if listener_count > 1 && !cfg!(unix) {
        tracing::warn!(
            "server.tcp_reuse_port_listener_count is set but SO_REUSEPORT is unavailable; using a single listener"
        );
        listener_count = 1;
    }

    if listener_count == 1 {
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        return Ok(vec![listener]);
    }

    (0..listener_count)
        .map(|_| bind_reuse_port_listener(host, port))
        .collect()
}

#[cfg(unix)]
fn bind_reuse_port_listener(host: &str, port: u16) -> io::Result<tokio::net::TcpListener> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match bind_reuse_port_listener_addr(addr) {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no bindable socket address for {host}:{port}"),
        )
    }))
}

#[cfg(unix)]
fn bind_reuse_port_listener_addr(addr: SocketAddr) -> io::Result<tokio::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(DEFAULT_LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener)
}

#[cfg(not(unix))]
fn bind_reuse_port_listener(_host: &str, _port: u16) -> io::Result<tokio::net::TcpListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_REUSEPORT is only supported on Unix-like platforms",
    ))
}
