use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

use accordrelay::bus::EventBus;
use accordrelay::clock::{Clock, SystemClock};
use accordrelay::config::Config;
use accordrelay::gateway::metrics::TracingMetrics;
use accordrelay::gateway::socket::TungsteniteFactory;
use accordrelay::gateway::GatewayConnection;
use accordrelay::invite::RoomInviteTokenService;
use accordrelay::state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accordrelay=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env();
    print_banner(&config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = EventBus::new();

    let gateway = config.gateway_options().map(|options| {
        GatewayConnection::new(
            options,
            bus.clone(),
            Arc::new(TungsteniteFactory),
            Arc::clone(&clock),
            Arc::new(TracingMetrics),
        )
    });
    if let Some(gateway) = &gateway {
        gateway.start();
    } else {
        tracing::warn!("ACCORD_GATEWAY_URL not set, running without an upstream connection");
    }

    let state = AppState {
        bus,
        gateway: gateway.clone(),
        invites: Arc::new(RoomInviteTokenService::new(
            config.room_token_secret.as_bytes(),
            Arc::clone(&clock),
        )),
        webhook_secret: Arc::from(config.webhook_secret.as_bytes()),
        webhook_max_skew_secs: config.webhook_max_skew_secs,
        clock,
    };

    let app = accordrelay::routes::router(state);

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .expect("failed to bind");

    let actual_port = listener
        .local_addr()
        .expect("failed to get local address")
        .port();
    eprintln!("  \x1b[32m→ listening on 0.0.0.0:{actual_port}\x1b[0m");
    eprintln!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    if let Some(gateway) = gateway {
        tracing::info!("closing upstream connection");
        gateway.stop().await;
    }
}

fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    let upstream = config
        .upstream
        .as_ref()
        .map(|u| u.url.as_str())
        .unwrap_or("none");

    eprintln!();
    eprintln!("  \x1b[1;36maccordrelay\x1b[0m \x1b[2mv{version}\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[2mport\x1b[0m         {}", config.port);
    eprintln!("  \x1b[2mupstream\x1b[0m     {upstream}");
    eprintln!("  \x1b[2mqueue\x1b[0m        {}", config.queue_max_size);
    eprintln!();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
