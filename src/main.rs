use clap::{Arg, Command};
use log::LevelFilter;
use spf_policyd::protocol::PolicyReader;
use spf_policyd::server::{self, ListenAddress};
use spf_policyd::{Config, PolicyEngine};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("spf-policyd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("SPF policy service for the Postfix policy delegation protocol")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/spf-policyd.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-request")
                .long("test-request")
                .value_name("FILE")
                .help("Evaluate one policy request read from FILE and print the action")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .help("Listen on host:port or unix:/path instead of stdin/stdout")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Log every attribute and handler decision")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/spf-policyd.yaml");

    let config_result = load_config(config_path);
    let verbose = matches.get_flag("verbose")
        || config_result.as_ref().map(|c| c.verbose).unwrap_or(false);

    // Initialize logger based on verbose flag
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let mut config = match config_result {
        Ok(config) => config,
        Err(e) => fatal(&format!("Error loading configuration: {e:#}")),
    };
    if let Some(listen) = matches.get_one::<String>("listen") {
        config.listen = Some(listen.clone());
    }

    let engine = match PolicyEngine::from_config(&config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => fatal(&format!("Error creating policy engine: {e:#}")),
    };

    if matches.get_flag("test-config") {
        println!("Configuration: {config_path}");
        println!("Receiver host name: {}", config.hostname);
        println!("Handlers: {}", engine.handler_names().join(", "));
        println!("Local origin networks: {:?}", config.local_origin_networks);
        println!("Trusted relays: {:?}", config.trusted_relays);
        println!("Default action: {}", config.default_action);
        println!("Configuration OK");
        return;
    }

    if let Some(request_file) = matches.get_one::<String>("test-request") {
        test_request_file(&engine, request_file).await;
        return;
    }

    log::info!("Starting spf-policyd {}...", env!("CARGO_PKG_VERSION"));

    let listen = ListenAddress::parse(config.listen.as_deref());
    if let Err(e) = server::run(engine, &listen).await {
        fatal(&format!("Policy service error: {e:#}"));
    }
}

/// Report a startup failure on every channel we have, then exit.
fn fatal(message: &str) -> ! {
    log::error!("{message}");
    eprintln!("{message}");
    process::exit(1);
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        // Logger is not up yet
        eprintln!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

async fn test_request_file(engine: &PolicyEngine, request_file: &str) {
    let content = match std::fs::read(request_file) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error reading request file: {e}");
            process::exit(1);
        }
    };

    // A file without the closing empty line is still one request
    let mut content = content;
    content.extend_from_slice(b"\n\n");

    let mut reader = PolicyReader::new(&content[..]);
    let request = match reader.next_request().await {
        Ok(Some(request)) => request,
        Ok(None) => {
            eprintln!("No policy request found in {request_file}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Error parsing request file: {e}");
            process::exit(1);
        }
    };

    println!("Client: {}", request.client_address());
    println!("HELO: {}", request.helo_name());
    println!("Sender: <{}>", request.sender());
    println!("Recipient: <{}>", request.recipient());
    println!();

    let action = engine.evaluate(&request).await;
    println!("action={action}");
}
