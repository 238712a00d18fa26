#[tokio::main]
async fn main() {
    gateway::start(std::env::args()).await;
}
