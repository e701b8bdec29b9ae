use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("controller=info,common=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match controller::cli::run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(2);
        }
    }
}
