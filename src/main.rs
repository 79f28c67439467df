//! setu-gw daemon entry point

use setu_gw::app::GatewayApp;
use setu_gw::{Config, Result};
use std::env;

/// Parse config path from command line arguments.
///
/// Supports:
/// - `setu-gw <path>` (positional)
/// - `setu-gw --config <path>` (flag-based)
/// - `setu-gw -c <path>` (short flag)
///
/// Defaults to `/etc/setu-gw.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    "/etc/setu-gw.toml".to_string()
}

fn main() -> Result<()> {
    let config_path = parse_config_path();
    let config = Config::load(&config_path)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.clone()),
    )
    .init();

    log::info!("setu-gw v0.3.0 starting");
    log::info!("Using config: {}", config_path);

    let mut app = GatewayApp::new(config)?;
    app.run()
}
