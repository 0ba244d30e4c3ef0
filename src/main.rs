use backtrace::Backtrace;
use clap::{Arg, Command};
use core::sync::atomic::{AtomicBool, Ordering};
use ringlog::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::time::sleep;

mod config;
mod metrics;
mod node;
mod shim;
mod store;
mod term;

use config::Config;
use node::gateway::{Gateway, GatewaySettings};
use node::Node;
use shim::{Registry, RegistrySettings};
use store::{ClientFactory, RiakClientFactory, SharedClientFactory};
use term::Term;

static RUNNING: AtomicBool = AtomicBool::new(true);

fn fatal(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        eprintln!("{s}");
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    // parse command line options
    let matches = Command::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_about(
            "Bridges a benchmark driver on a distributed runtime to key-value \
            store clients. The driver asks the registry mailbox for workers and \
            sends store operations straight to them.",
        )
        .arg(
            Arg::new("CONFIG")
                .help("Configuration file")
                .action(clap::ArgAction::Set)
                .index(1),
        )
        .get_matches();

    // load config from file, or run with defaults
    let config = match matches.get_one::<String>("CONFIG") {
        Some(file) => Config::new(file),
        None => Config::default(),
    };

    // configure debug log
    let debug_output: Box<dyn Output> = if let Some(file) = config.debug().log_file() {
        let backup = config
            .debug()
            .log_backup()
            .unwrap_or(format!("{}.old", file));
        match File::new(&file, &backup, config.debug().log_max_size()) {
            Ok(f) => Box::new(f),
            Err(e) => fatal(format!("failed to open debug log file: {e}")),
        }
    } else {
        // by default, log to stderr
        Box::new(Stderr::new())
    };

    let level = config.debug().log_level();

    let builder = if level <= Level::Info {
        LogBuilder::new().format(ringlog::default_format)
    } else {
        LogBuilder::new()
    };

    let debug_log = match builder
        .output(debug_output)
        .log_queue_depth(config.debug().log_queue_depth())
        .single_message_size(config.debug().log_single_message_size())
        .build()
    {
        Ok(log) => log,
        Err(e) => fatal(format!("failed to initialize debug log: {e}")),
    };

    let mut log = MultiLogBuilder::new()
        .level_filter(level.to_level_filter())
        .default(debug_log)
        .build()
        .start();

    // initialize async runtime for control plane
    let control_runtime = match Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .build()
    {
        Ok(rt) => rt,
        Err(e) => fatal(format!("failed to initialize tokio runtime: {e}")),
    };

    // spawn logging thread
    control_runtime.spawn(async move {
        while RUNNING.load(Ordering::Relaxed) {
            sleep(Duration::from_millis(1)).await;
            let _ = log.flush();
        }
        let _ = log.flush();
    });

    output!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    // workers run on their own runtime
    let worker_runtime = match Builder::new_multi_thread()
        .enable_all()
        .worker_threads(config.registry().threads())
        .thread_name("worker")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => fatal(format!("failed to initialize tokio runtime: {e}")),
    };

    let node = Node::new(config.general().name());

    let factory: Arc<dyn ClientFactory> = if config.registry().share_clients() {
        Arc::new(SharedClientFactory::new(RiakClientFactory))
    } else {
        Arc::new(RiakClientFactory)
    };

    let registry = Registry::new(
        &node,
        config.registry().mailbox(),
        factory,
        worker_runtime.handle().clone(),
        RegistrySettings {
            default_buffer_kb: config.registry().default_buffer_kb(),
            connect_timeout: config.registry().connect_timeout(),
            decode_policy: config.worker().decode_error_policy(),
        },
    );
    info!("registry {} is registered as {}", registry.pid(), config.registry().mailbox());
    let registry = control_runtime.spawn(registry.run());

    let gateway = match control_runtime.block_on(Gateway::bind(
        config.listener().address(),
        node.clone(),
        GatewaySettings {
            cookie: config.general().cookie().map(str::to_owned),
            max_frame_size: config.listener().max_frame_size(),
        },
    )) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("failed to listen on {}: {e}", config.listener().address());
            RUNNING.store(false, Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(100));
            fatal(format!("failed to listen on {}: {e}", config.listener().address()));
        }
    };
    control_runtime.spawn(gateway.serve());

    // periodic stats
    control_runtime.spawn(metrics::log(config.general().interval()));

    // an interrupt stops the registry, which stops its workers
    {
        let node = node.clone();
        let mailbox = config.registry().mailbox().to_owned();
        control_runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, shutting down");
                node.exit_named(&mailbox, Term::atom("interrupted"));
            }
        });
    }

    if let Err(e) = control_runtime.block_on(registry) {
        error!("registry task failed: {e}");
    }

    // shutdown
    node.shutdown();
    worker_runtime.shutdown_timeout(Duration::from_millis(100));
    RUNNING.store(false, Ordering::Relaxed);

    // delay before exiting so the log can drain
    std::thread::sleep(Duration::from_millis(100));
    control_runtime.shutdown_timeout(Duration::from_millis(100));
}
