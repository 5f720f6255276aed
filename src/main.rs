use std::panic;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::{Args, Config, SandboxKind};
use crate::core::pipeline::running::Pipeline;
use crate::core::registry::Registry;
use crate::core::traits::sandbox::Sandbox;
use crate::native::local::LocalSandbox;
use crate::native::namespace::NamespaceSandbox;

mod config;
mod constants;
mod core;
mod native;
mod transport;


#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    config.apply(&args);
    config.validate()?;
    let layout = Arc::new(config.layout());

    let registry = Arc::new(Registry::build(&config.data_files_path).await?);

    let sandbox: Arc<dyn Sandbox> = match config.sandbox {
        SandboxKind::Namespace => Arc::new(NamespaceSandbox::new(
            &config.rootfs.rootfs_path,
            &config.cgroup_parent,
            config.rootfs.work_user,
        )?),
        SandboxKind::Local => {
            tracing::warn!("Running submissions without isolation");
            Arc::new(LocalSandbox::new(&config.rootfs.rootfs_path))
        }
    };

    let pipeline = Arc::new(Pipeline::new(sandbox, registry, layout));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Worker listening on {}", config.listen_addr);
    transport::serve(listener, pipeline).await;

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
