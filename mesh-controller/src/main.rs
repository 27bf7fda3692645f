mod args;
mod controller;
mod logger;

use clap::Parser;
use kube::{Client, Config};

use args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init(args.verbose);

    if let Some(path) = &args.kubeconfig {
        std::env::set_var("KUBECONFIG", path);
    }
    let config = Config::infer()
        .await
        .map_err(|e| mesh_core::Error::Environment(format!("cannot reach Kubernetes API: {e}")))?;
    let client = Client::try_from(config).map_err(|e| {
        mesh_core::Error::Environment(format!("cannot build Kubernetes client: {e}"))
    })?;

    log::info!("starting mesh controller for compartment {}", args.wg_namespace);
    let ctx = controller::startup(&args, &client).await?;
    log::info!(
        "node {} joined the mesh, watching cluster nodes",
        ctx.hostname
    );
    controller::run(client, ctx).await
}
