use envconfig::Envconfig;
use nilis_server::{NilisConfig, NilisError, start_server};
use tracing::{debug, error, info};

fn init_log() {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{
        EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("NILIS_LOG")
                .from_env_lossy(),
        )
        .init();
}

fn main() -> Result<(), NilisError> {
    init_log();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start())
}

async fn start() -> Result<(), NilisError> {
    let conf = NilisConfig::init_from_env()?;
    debug!("use nilis config: {:?}", conf);
    let mut node = match start_server(&conf).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "failed to start nilis");
            return Err(e);
        }
    };

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "unable to listen for shutdown signal");
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("starting a clean up for shutdown");
        }
        result = node.stopped() => {
            if let Err(e) = &result {
                error!(error = %e, "gRPC server exited");
            }
            node.close().await?;
            return result;
        }
    }
    node.close().await
}
