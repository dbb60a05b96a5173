#[tokio::main]
async fn main() {
    if let Err(err) = relay::server::run().await {
        tracing::error!(?err, "relay server exited with error");
        std::process::exit(1);
    }
}
