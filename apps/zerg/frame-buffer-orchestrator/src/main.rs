#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_frame_buffer_orchestrator::run().await
}
