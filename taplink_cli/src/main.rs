mod cli;

use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(err) = cli::run().await {
        error!("{}", err);
        eprintln!("taplink: {err}");
        std::process::exit(1);
    }
}
