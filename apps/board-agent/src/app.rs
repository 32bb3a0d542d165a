//! Application orchestrator: wires the board components together.

use std::net::SocketAddr;
use std::sync::Arc;

use astropi_agent_server::{AgentServer, ServerConfig};
use astropi_board::{
    BoardHandler, CameraDevice, ImagingSession, Outbox, ShellRunner, SimulatedCamera, shared,
};
use astropi_config_store::ConfigStore;
use astropi_data_channel::{TransferQueue, TransferSender};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the board agent until Ctrl-C or a listener fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Camera --
    let camera = SimulatedCamera::new(&config.capture_dir)
        .with_model(config.camera.model.clone())
        .with_resolution(config.camera.width, config.camera.height)
        .with_frame_bytes(config.camera.frame_bytes);
    let mut details = camera.details();
    details.board = config.name.clone();
    tracing::info!(
        model = %details.model,
        dir = %config.capture_dir.display(),
        "camera ready"
    );

    // -- Session --
    let store = ConfigStore::with_config(config.settings.clone());
    let queue = TransferQueue::new(config.queue_capacity);
    let outbox = Outbox::new();
    let session = ImagingSession::new(store.clone(), shared(camera), queue.clone(), outbox.clone());

    // -- File transfer --
    let transfer = TransferSender::new(queue);
    let transfer_listener =
        TcpListener::bind(SocketAddr::new(config.bind, config.transfer_port)).await?;
    let transfer_task = {
        let transfer = transfer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { transfer.run(transfer_listener, cancel).await })
    };

    // -- Command server --
    let handler = BoardHandler::new(
        store,
        session.clone(),
        details,
        Arc::new(ShellRunner::new(
            config.pull_command.clone(),
            config.update_command.clone(),
        )),
        outbox,
        transfer,
    );
    let server = AgentServer::new(
        ServerConfig {
            bind: config.bind,
            port: config.command_port,
            framing: config.framing,
        },
        Arc::new(handler),
    );
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tracing::info!(
        command_port = config.command_port,
        transfer_port = config.transfer_port,
        "board agent ready"
    );

    // -- Main loop: wait for shutdown --
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            Ok(())
        }
        joined = server_task => {
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::anyhow!("command server failed: {e}")),
                Err(e) => Err(anyhow::anyhow!("command server task failed: {e}")),
            }
        }
    };

    // -- Graceful shutdown --
    tracing::info!("stopping services...");
    session.shutdown();
    server.shutdown();
    cancel.cancel();
    match transfer_task.await {
        Ok(Err(e)) => tracing::warn!("transfer channel stopped with error: {e}"),
        Err(e) => tracing::warn!("transfer task failed: {e}"),
        Ok(Ok(())) => {}
    }

    result
}
