use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    microbots::cli::run().await
}
