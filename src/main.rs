use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, Level};
use tracing_subscriber;

use metalforge_backend::{api_router, build_app, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing with more verbose output
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("🚀 Starting MetalForge Backend...");

    // Load configuration
    let config = match Config::load() {
        Ok(config) => {
            info!("✅ Configuration loaded");
            config
        }
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    let server_address = config.server_address.clone();

    // Wire the store, the services and the background monitor
    let (app_state, monitor) = build_app(config);
    monitor.spawn();
    info!("✅ Monitor loop started");

    // Build the application router
    let app = api_router(app_state).layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
    );

    // Start the server
    let listener = match tokio::net::TcpListener::bind(&server_address).await {
        Ok(listener) => {
            info!("🌐 Server listening on {}", server_address);
            listener
        }
        Err(e) => {
            eprintln!("❌ Failed to bind to {}: {}", server_address, e);
            return Err(e.into());
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("❌ Server error: {}", e);
        return Err(e.into());
    }

    info!("✅ Server stopped gracefully");
    Ok(())
}
