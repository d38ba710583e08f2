#[tokio::main]
async fn main() {
    if let Err(e) = rating_engine::start_server().await {
        eprintln!("rating service stopped: {e}");
        std::process::exit(1);
    }
}
