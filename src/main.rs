use anyhow::Result;
use std::env;

mod cli;
mod core;
mod gui;
mod server;

use crate::core::config::ClientConfig;
use cli::commands::run_cli;
use gui::app::run_gui;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    // No arguments or a lone "--gui" opens the window, everything else is CLI
    if args.len() == 1 || (args.len() == 2 && args[1] == "--gui") {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();

        let mut config = ClientConfig::default();
        if let Ok(url) = env::var("ICREADER_API_URL") {
            config.base_url = url;
        }

        println!("Starting IC Card Reader GUI...");
        run_gui(config)
    } else {
        run_cli()
    }
}
