use broker_core::config::Config;
use broker_core::{app, logging, App};
use clap::{App as ClapApp, Arg};
use sloggers::types::Severity;
use std::path::PathBuf;
use std::process;

fn parse_args() -> Config {
    let cli = ClapApp::new("ledgerd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("TCP broker that fans out append-only ledger entries between cooperating clients")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .takes_value(true)
                .default_value("0.0.0.0")
                .help("Address to listen on"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .default_value("13248")
                .help("Port to listen on"),
        )
        .arg(
            Arg::with_name("data-dir")
                .short("d")
                .long("data-dir")
                .takes_value(true)
                .default_value("./data")
                .help("Directory holding per-ledger data files"),
        );

    let matches = match cli.get_matches_safe() {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(match err.kind {
                clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed => 0,
                _ => 2,
            });
        }
    };

    let port: u16 = match matches.value_of("port").unwrap().parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("ledgerd: invalid port");
            process::exit(2);
        }
    };

    Config {
        host: matches.value_of("host").unwrap().to_string(),
        port,
        data_dir: PathBuf::from(matches.value_of("data-dir").unwrap()),
    }
}

fn main() {
    app::ignore_sigpipe();

    let config = parse_args();
    let log = logging::build(Severity::Info);

    let mut broker = match App::init(&config, log.clone()) {
        Ok(broker) => broker,
        Err(err) => {
            eprintln!("ledgerd: {}", err);
            process::exit(1);
        }
    };

    let shutdown = broker.shutdown_handle();
    for signal in &[signal_hook::SIGINT, signal_hook::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(*signal, shutdown.clone()) {
            eprintln!("ledgerd: failed to install signal handler: {}", err);
            process::exit(1);
        }
    }

    if let Err(err) = broker.listen(&config.host, config.port) {
        eprintln!("ledgerd: {}", err);
        process::exit(1);
    }

    let run_result = broker.run();
    broker.quit();

    if let Err(err) = run_result {
        eprintln!("ledgerd: {}", err);
        process::exit(1);
    }
}
