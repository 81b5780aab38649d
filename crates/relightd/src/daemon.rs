//! Daemon assembly: config loading, subsystem wiring and shutdown.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use relight_control::{ControlPlane, SlicerClient};
use relight_core::RelightConfig;
use relight_proxy::ProxyState;
use relight_state::VmStateManager;
use relight_watcher::{IdleWatcher, WatchConfig};

/// Load, override and validate the config file.
pub fn load_config(
    path: &Path,
    listen: Option<SocketAddr>,
    ask_listen: Option<SocketAddr>,
) -> anyhow::Result<RelightConfig> {
    let mut config = RelightConfig::from_file(path)?;
    config.apply_env();
    if listen.is_some() {
        config.server.listen = listen;
    }
    if ask_listen.is_some() {
        config.server.ask_listen = ask_listen;
    }
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// The config as it will be used, defaults filled in and the token hidden.
pub fn render_effective(config: &RelightConfig) -> anyhow::Result<String> {
    let mut effective = config.clone();
    if !effective.control_plane.token.is_empty() {
        effective.control_plane.token = "<redacted>".to_string();
    }
    let routing = &mut effective.routing;
    routing.idle_timeout = Some(routing.idle_timeout());
    routing.wake_timeout = Some(routing.wake_timeout());
    routing.watch_interval = Some(routing.watch_interval());
    routing.app_port = Some(u32::from(routing.app_port()));
    effective.server.listen = Some(effective.server.listen());
    Ok(effective.to_toml_string()?)
}

/// Run until Ctrl-C.
pub async fn run(config: RelightConfig) -> anyhow::Result<()> {
    info!("relight daemon starting");

    let endpoint = config.endpoint()?;
    let control: Arc<dyn ControlPlane> = Arc::new(SlicerClient::new(
        endpoint,
        &config.control_plane.token,
        &config.control_plane.host_group,
    ));
    info!(
        url = %config.control_plane.url,
        host_group = %config.control_plane.host_group,
        "control plane client initialized"
    );

    let listen = config.server.listen();
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind proxy listener on {listen}"))?;
    let ask_listener = match config.server.ask_listen {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind ask listener on {addr}"))?,
        ),
        None => None,
    };

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    };

    serve(&config, control, listener, ask_listener, ctrl_c).await?;

    info!("relight daemon stopped");
    Ok(())
}

/// Wire the subsystems onto already-bound listeners and serve until
/// `shutdown` resolves.
pub async fn serve(
    config: &RelightConfig,
    control: Arc<dyn ControlPlane>,
    listener: TcpListener,
    ask_listener: Option<TcpListener>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let routing = &config.routing;

    let state = VmStateManager::new(Arc::clone(&control));

    let watcher = IdleWatcher::new(
        state.clone(),
        control,
        WatchConfig {
            interval: routing.watch_interval(),
            idle_timeout: routing.idle_timeout(),
        },
    );
    watcher.start();

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx.send(true);
    });

    // ── Servers ────────────────────────────────────────────────

    let proxy = relight_proxy::build_router(ProxyState::new(
        state.clone(),
        routing.app_port(),
        routing.wake_timeout(),
        shutdown_rx.clone(),
    ));
    info!(addr = %listener.local_addr()?, app_port = routing.app_port(), "proxy listening");
    let proxy_server = axum::serve(
        listener,
        proxy.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));

    let ask_server = async {
        let Some(ask_listener) = ask_listener else {
            return Ok(());
        };
        info!(addr = %ask_listener.local_addr()?, "ask server listening");
        axum::serve(ask_listener, relight_proxy::build_ask_router(state.clone()))
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()))
            .await
    };

    let served = tokio::try_join!(proxy_server.into_future(), ask_server);

    watcher.stop_and_wait().await;
    served.context("http server failed")?;
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use relight_control::{MemoryControlPlane, NodeInfo, RemoteStatus};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const CONFIG: &str = r#"
[control_plane]
url = "http://127.0.0.1:9"
token = "secret"
host_group = "apps"

[routing]
idle_timeout = "60s"
"#;

    async fn raw_get(addr: SocketAddr, host: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn effective_config_fills_defaults_and_hides_token() {
        let config = RelightConfig::from_toml_str(CONFIG).unwrap();
        let rendered = render_effective(&config).unwrap();

        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("wake_timeout = \"30s\""));
        assert!(rendered.contains("app_port = 8080"));
        assert!(rendered.contains("0.0.0.0:8081"));
    }

    #[test]
    fn cli_listen_overrides_file() {
        let dir = std::env::temp_dir().join(format!("relightd-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relight.toml");
        std::fs::write(&path, CONFIG).unwrap();

        let listen: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let config = load_config(&path, Some(listen), None).unwrap();
        assert_eq!(config.server.listen(), listen);
        assert!(config.server.ask_listen.is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let config = RelightConfig::from_toml_str(CONFIG).unwrap();
        let control = Arc::new(MemoryControlPlane::new().with_node(
            NodeInfo::new("vm-alpha", "127.0.0.1", RemoteStatus::Paused).with_tag("alpha.local"),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ask_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let ask_addr = ask_listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let daemon = tokio::spawn(async move {
            serve(&config, control, listener, Some(ask_listener), async move {
                let _ = stop_rx.await;
            })
            .await
        });

        let resp = raw_get(proxy_addr, "ghost.local", "/").await;
        assert!(resp.starts_with("HTTP/1.1 404"), "{resp}");

        let resp = raw_get(ask_addr, "localhost", "/check?domain=alpha.local").await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), daemon)
            .await
            .expect("daemon stops")
            .unwrap()
            .unwrap();
    }
}
