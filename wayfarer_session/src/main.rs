// CLI entry point for a standalone Wayfarer session host.
//
// Runs the coordinator only; games (including the host player's) join it as
// peers. See `server.rs` for the threading model and `session.rs` for the
// coordinator itself.
//
// Usage:
//   host [OPTIONS]
//     --config <FILE>      JSON `SessionConfig`; other flags override it
//     --port <PORT>        Listen port (default: 7777)
//     --bind <ADDR>        Listen address (default: 0.0.0.0)
//     --name <NAME>        Session name (default: wayfarer-session)
//     --max-peers <N>      Max peers, host included (default: 4)
//     --save-dir <DIR>     Directory for host save slots (default: none)
//
// Logging goes through `env_logger`; set `RUST_LOG` to change the level
// (default `info`).

use std::path::PathBuf;
use std::time::Duration;

use wayfarer_session::config::SessionConfig;
use wayfarer_session::server::start_host;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = parse_args();
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let (handle, addr) = match start_host(config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start host: {e}");
            std::process::exit(1);
        }
    };

    println!("Session listening on {addr}");
    println!("Press Ctrl+C to stop.");

    // The process exits on SIGINT; until then just watch the host thread.
    while handle.is_running() {
        std::thread::sleep(Duration::from_millis(200));
    }
    handle.stop();
}

/// Parse command-line arguments into a `SessionConfig`. Plain
/// `std::env::args()` matching; `--config` is applied before any other flag
/// regardless of position.
fn parse_args() -> SessionConfig {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).map(PathBuf::from).unwrap_or_else(|| {
                eprintln!("--config requires a file path");
                std::process::exit(1);
            });
            SessionConfig::from_json_file(&path).unwrap_or_else(|e| {
                eprintln!("{e}");
                std::process::exit(1);
            })
        }
        None => SessionConfig::default(),
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
            }
            "--port" => {
                i += 1;
                config.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--bind" => {
                i += 1;
                config.bind_address = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--bind requires an address");
                    std::process::exit(1);
                });
            }
            "--name" => {
                i += 1;
                config.session_name = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--name requires a value");
                    std::process::exit(1);
                });
            }
            "--max-peers" => {
                i += 1;
                config.max_peers = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--max-peers requires a valid number");
                    std::process::exit(1);
                });
            }
            "--save-dir" => {
                i += 1;
                config.save_dir = Some(args.get(i).map(PathBuf::from).unwrap_or_else(|| {
                    eprintln!("--save-dir requires a directory");
                    std::process::exit(1);
                }));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_usage() {
    println!("Usage: host [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <FILE>      JSON session config; flags override it");
    println!("  --port <PORT>        Listen port (default: 7777)");
    println!("  --bind <ADDR>        Listen address (default: 0.0.0.0)");
    println!("  --name <NAME>        Session name (default: wayfarer-session)");
    println!("  --max-peers <N>      Max peers, host included (default: 4)");
    println!("  --save-dir <DIR>     Directory for host save slots");
    println!("  --help, -h           Show this help");
}
