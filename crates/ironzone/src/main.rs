use clap::Parser as _;
use ironzone::{setup_logging, App, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging()?;

    let args = Args::parse();
    App::run_until_completion(args).await
}
