// ------------------------------------------------------------
// localrun: expose a local HTTP server through a public tunnel
// ------------------------------------------------------------
//
// This is the CLI entry point. Responsibilities:
// - Initialize cryptography backend (rustls)
// - Initialize logging (DEBUG environment variable)
// - Parse flags and LR_* environment overrides into a TunnelConfig
// - Open the tunnel session and surface its events
// - Shut down gracefully on SIGINT / SIGTERM
//
// Everything tunnel-shaped lives in the library; this file only
// translates between the terminal and the session.
//

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn};
use rustls::crypto::{CryptoProvider, ring};
use tokio::signal::unix::{SignalKind, signal};

use localrun::config::{self, TunnelConfig};
use localrun::{Session, SessionEvent};

fn validate_port_value(value: &str) -> Result<u16, String> {
    match value.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err("port must be an integer between 1 and 65535".to_owned()),
    }
}

fn validate_subdomain_value(value: &str) -> Result<String, String> {
    if config::valid_subdomain(value) {
        Ok(value.to_owned())
    } else {
        Err("subdomain must be exactly 10 alphanumeric characters".to_owned())
    }
}

fn validate_ms_value(value: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|_| "expected a duration in milliseconds".to_owned())
}

fn validate_retries_value(value: &str) -> Result<u32, String> {
    value
        .parse::<u32>()
        .map_err(|_| "expected a retry count".to_owned())
}

fn cli() -> Command {
    // -h is taken by --host, so the automatic help short is disabled
    // and --help re-added by hand.
    Command::new("localrun")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Expose a local HTTP server through a public tunnel URL")
        .disable_help_flag(true)
        .arg(
            Arg::new("help")
                .long("help")
                .help("Print help")
                .action(ArgAction::Help),
        )
        .arg(
            Arg::new("port")
                .help("Port of the local server to expose")
                .short('p')
                .long("port")
                .value_parser(validate_port_value),
        )
        .arg(
            Arg::new("host")
                .help("Base URL of the tunnel broker")
                .short('h')
                .long("host"),
        )
        .arg(
            Arg::new("subdomain")
                .help("Requested subdomain (exactly 10 alphanumeric characters)")
                .short('s')
                .long("subdomain")
                .value_parser(validate_subdomain_value),
        )
        .arg(
            Arg::new("local_host")
                .help("Hostname of the local server")
                .short('l')
                .long("local-host"),
        )
        .arg(
            Arg::new("local_https")
                .help("Dial the local server over HTTPS")
                .long("local-https")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("local_cert")
                .help("Client certificate (PEM) for the local server")
                .long("local-cert"),
        )
        .arg(
            Arg::new("local_key")
                .help("Client key (PEM) for the local server")
                .long("local-key"),
        )
        .arg(
            Arg::new("local_ca")
                .help("Extra root CA (PEM) for the local server")
                .long("local-ca"),
        )
        .arg(
            Arg::new("allow_invalid_cert")
                .help("Skip certificate verification of the local server")
                .long("allow-invalid-cert")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timeout")
                .help("Base per-request timeout in milliseconds")
                .long("timeout")
                .value_parser(validate_ms_value),
        )
        .arg(
            Arg::new("max_retries")
                .help("Retries per failed request")
                .long("max-retries")
                .value_parser(validate_retries_value),
        )
        .arg(
            Arg::new("open")
                .help("Show the public URL prominently for opening in a browser")
                .short('o')
                .long("open")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("print_requests")
                .help("Print every forwarded request to stdout")
                .long("print-requests")
                .action(ArgAction::SetTrue),
        )
}

// ------------------------------------------------------------
// LR_* environment fallbacks
// ------------------------------------------------------------
//
// Every option can also come from the environment with an LR_ prefix
// (LR_PORT, LR_SUBDOMAIN, …). Flags win over the environment.
//

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn opt_string(matches: &ArgMatches, id: &str, env_key: &str) -> Option<String> {
    matches
        .get_one::<String>(id)
        .cloned()
        .or_else(|| env_string(env_key))
}

fn opt_parsed<T, F>(
    matches: &ArgMatches,
    id: &str,
    env_key: &str,
    parse: F,
) -> Result<Option<T>, String>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&str) -> Result<T, String>,
{
    if let Some(v) = matches.get_one::<T>(id) {
        return Ok(Some(v.clone()));
    }
    match env_string(env_key) {
        Some(raw) => parse(&raw)
            .map(Some)
            .map_err(|e| format!("{}: {}", env_key, e)),
        None => Ok(None),
    }
}

fn env_flag(matches: &ArgMatches, id: &str, env_key: &str) -> bool {
    if matches.get_flag(id) {
        return true;
    }
    matches!(
        env_string(env_key).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn build_config(matches: &ArgMatches) -> Result<TunnelConfig, String> {
    let port = opt_parsed(matches, "port", "LR_PORT", validate_port_value)?
        .ok_or_else(|| "a local port is required (--port or LR_PORT)".to_owned())?;

    let mut cfg = TunnelConfig::new(port);

    if let Some(host) = opt_string(matches, "host", "LR_HOST") {
        cfg.broker_url = host;
    }
    if let Some(sub) = opt_string(matches, "subdomain", "LR_SUBDOMAIN") {
        cfg.subdomain = Some(sub);
    }
    if let Some(local_host) = opt_string(matches, "local_host", "LR_LOCAL_HOST") {
        cfg.local_host = local_host;
    }
    if let Some(timeout) = opt_parsed(matches, "timeout", "LR_TIMEOUT", validate_ms_value)? {
        cfg.timeout_ms = timeout;
    }
    if let Some(retries) =
        opt_parsed(matches, "max_retries", "LR_MAX_RETRIES", validate_retries_value)?
    {
        cfg.max_retries = retries;
    }

    cfg.tls.use_tls = env_flag(matches, "local_https", "LR_LOCAL_HTTPS");
    cfg.tls.allow_invalid_cert = env_flag(matches, "allow_invalid_cert", "LR_ALLOW_INVALID_CERT");
    cfg.tls.cert_path = opt_string(matches, "local_cert", "LR_LOCAL_CERT");
    cfg.tls.key_path = opt_string(matches, "local_key", "LR_LOCAL_KEY");
    cfg.tls.ca_path = opt_string(matches, "local_ca", "LR_LOCAL_CA");

    Ok(cfg)
}

// ------------------------------------------------------------
// Entry point
// ------------------------------------------------------------

#[tokio::main]
async fn main() {
    // rustls >= 0.23 requires an explicit CryptoProvider installation,
    // exactly once and as early as possible in the process lifecycle.
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    // DEBUG carries the log filter (e.g. DEBUG=debug or
    // DEBUG=localrun=trace); default is info-level.
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("DEBUG", "info")).init();

    let matches = cli().get_matches();
    let print_requests = env_flag(&matches, "print_requests", "LR_PRINT_REQUESTS");
    let open_url = env_flag(&matches, "open", "LR_OPEN");

    let cfg = match build_config(&matches) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = cfg.validate() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    info!(
        "localrun {} starting, forwarding to {}",
        env!("CARGO_PKG_VERSION"),
        cfg.origin_authority()
    );

    let mut session = match Session::open(cfg).await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    let info = session.info().clone();
    println!("your url is: {}", info.url);
    if let Some(cached) = &info.cached_url {
        println!("cached url:  {}", cached);
    }
    if open_url {
        println!("open in your browser: {}", info.url);
    }

    let mut events = session
        .take_events()
        .expect("event receiver taken exactly once here");
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler installs");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                session.graceful_shutdown().await;
                std::process::exit(130);
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                session.graceful_shutdown().await;
                std::process::exit(143);
            }
            event = events.recv() => match event {
                Some(SessionEvent::Url(url)) => {
                    info!("tunnel connected at {}", url);
                }
                Some(SessionEvent::Request { method, path, .. }) => {
                    if print_requests {
                        println!("{} {}", method, path);
                    }
                }
                Some(SessionEvent::Error(e)) => {
                    error!("{}", e);
                }
                Some(SessionEvent::CircuitBreakerOpen { consecutive_errors, cooldown_ms }) => {
                    warn!(
                        "local server unreachable ({} consecutive errors), rejecting requests for {} ms",
                        consecutive_errors, cooldown_ms
                    );
                }
                Some(SessionEvent::CircuitBreakerClosed) => {
                    info!("local server recovered, forwarding resumed");
                }
                Some(SessionEvent::Closed) | None => {
                    info!("tunnel closed");
                    break;
                }
            }
        }
    }
}
