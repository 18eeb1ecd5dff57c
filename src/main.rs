#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use hubproxy::server;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hubproxy", about = "Accelerating reverse proxy for OCI registries and GitHub/Hugging Face downloads")]
struct Cli {
    /// Path to config file (TOML or JSON)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address for the proxy
    #[arg(short, long, default_value = "0.0.0.0:5000")]
    listen: String,

    /// Admin API listen address (health/ready/metrics)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
