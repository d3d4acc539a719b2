use anyhow::Result;
use tesser_cli::app;
use tesser_paper::register_factory as register_paper_factory;

#[tokio::main]
async fn main() -> Result<()> {
    register_paper_factory();
    app::run().await
}
