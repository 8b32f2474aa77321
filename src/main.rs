use anyhow::Result;
use clap::Parser;
use routingd::app::AppBuilder;
use routingd::config::{Cli, Config};
use std::fs::File;
use tokio::select;
use tracing::{info, level_filters::LevelFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = cli
        .conf
        .as_deref()
        .filter(|path| std::path::Path::new(path).exists())
        .map(|path| Config::load(path).expect("Failed to load config"))
        .unwrap_or_default();

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, _guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    let app = AppBuilder::new()
        .config(config)
        .web_only(cli.web_only)
        .build()
        .expect("Failed to build app");
    let token = app.token();

    info!("starting routingd on {}", app.config.http_addr);
    select! {
        result = app.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received CTRL+C, shutting down");
            token.cancel();
        }
    }
    Ok(())
}
