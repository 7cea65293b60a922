use anyhow::Context;
use std::process;
use std::sync::Arc;
use tarn::config::{DEFAULT_PORT, DEFAULT_WORKER_THREADS};
use tarn::{PoolConfig, Reactor, Response, Server, ServerConfig, ThreadPool};
use tracing::info;

fn print_usage() {
    println!(
        "Usage: tarn [options]\n\
         Options:\n\
         \x20 --port <number>     TCP port to listen on (default: {DEFAULT_PORT})\n\
         \x20 --threads <number>  worker thread count (default: {DEFAULT_WORKER_THREADS})\n\
         \x20 --help              show this help message"
    );
}

fn parse_args() -> Option<(u16, usize)> {
    let mut port = DEFAULT_PORT;
    let mut threads = DEFAULT_WORKER_THREADS;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return None;
            }
            "--port" | "-p" => {
                port = args
                    .next()
                    .and_then(|v| v.parse::<u16>().ok())
                    .unwrap_or_else(|| {
                        eprintln!("Invalid port, using default {DEFAULT_PORT}");
                        DEFAULT_PORT
                    });
            }
            "--threads" | "-t" => {
                threads = args
                    .next()
                    .and_then(|v| v.parse::<usize>().ok())
                    .filter(|&n| n > 0)
                    .unwrap_or_else(|| {
                        eprintln!("Invalid thread count, using default {DEFAULT_WORKER_THREADS}");
                        DEFAULT_WORKER_THREADS
                    });
            }
            other => {
                eprintln!("Ignoring unknown option '{other}'");
            }
        }
    }

    Some((port, threads))
}

fn run(port: u16, threads: usize) -> anyhow::Result<()> {
    let reactor = Arc::new(Reactor::new().context("failed to create reactor")?);
    let pool = Arc::new(ThreadPool::new(PoolConfig {
        core_threads: threads,
        ..PoolConfig::default()
    }));

    let config = ServerConfig {
        port,
        worker_threads: threads,
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::new(config, reactor.clone(), pool.clone()));

    server.get("/", |_req| Response::html("<h1>tarn</h1>"));
    server.get("/hello", |_req| Response::text("hi"));
    server.post("/echo", |req| Response::ok(req.body().to_vec()));

    server.start().context("server startup failed")?;
    server
        .install_signal_handlers()
        .context("failed to install signal handlers")?;

    reactor.run().context("event loop failed")?;

    info!("event loop exited, draining workers");
    pool.shutdown(true);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let Some((port, threads)) = parse_args() else {
        return; // --help
    };

    if let Err(e) = run(port, threads) {
        eprintln!("tarn: {e:#}");
        process::exit(1);
    }
}
