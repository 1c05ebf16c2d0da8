use clap::Parser;
use console::style;

mod cli;

#[tokio::main]
async fn main() {
    // a missing .env is fine, the key can live in the config file
    let _ = dotenvy::dotenv();
    holdscan_utils::log::init();

    let cli = cli::Cli::parse();
    if let Err(err) = cli.run().await {
        eprintln!("{} {err}", style("error:").red());
        std::process::exit(1);
    }
}
