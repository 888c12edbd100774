use std::sync::atomic::{AtomicUsize, Ordering};

use clap::Parser;
use log::{error, info};
use migration::MigrationOptions;
use segment_tool::{cli::Commands, Cli};

fn main() {
    let cli = Cli::parse();

    let Commands::Migrate(args) = cli.command;
    if let Err(e) = args.init_log() {
        eprintln!("Failed to initialize log. Cause: {:?}", e);
        std::process::exit(2);
    }

    let configuration = match args.create_config() {
        Ok(configuration) => configuration,
        Err(e) => {
            eprintln!("Invalid configuration. Cause: {:?}", e);
            std::process::exit(2);
        }
    };

    let options = MigrationOptions::from(&configuration);
    let retry = options.retry.clone();
    let signals = AtomicUsize::new(0);
    if let Err(e) = ctrlc::set_handler(move || {
        if signals.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("Received interrupt signal, cutting pending retry waits short. Interrupt again to exit");
            retry.interrupt();
        } else {
            std::process::exit(130);
        }
    }) {
        eprintln!("Failed to set Ctrl-C handler. Cause: {:?}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .thread_name("segment-tool")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build runtime. Cause: {:?}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(segment_tool::migrate(&configuration, options)) {
        Ok(summary) => info!("Migration completed: {}", summary),
        Err(e) => {
            error!("Migration failed: {:?}", e);
            eprintln!("Migration failed. Cause: {:?}", e);
            std::process::exit(1);
        }
    }
}
