use std::{
    fs::File,
    io::{self, BufReader},
    process::ExitCode,
    time::Duration,
};

use args::Args;
use clap::Parser;
use input::Format;
use tracing::{debug, Level};
use zabbix_sender::{resolve_hostname, MetricRecord, SenderBuilder, TlsConfig};

mod args;
mod input;

fn records(args: &Args) -> Result<Vec<MetricRecord>, Box<dyn std::error::Error>> {
    let host = resolve_hostname(args.host.as_deref())?;
    if let Some(path) = &args.input_file {
        let format = Format {
            timestamps: args.with_timestamps,
            ns: args.with_ns,
        };
        let records = if path.as_os_str() == "-" {
            input::read_records(io::stdin().lock(), &host, format)?
        } else {
            input::read_records(BufReader::new(File::open(path)?), &host, format)?
        };
        Ok(records)
    } else {
        let key = args.key.clone().unwrap_or_default();
        let value = args.value.clone().unwrap_or_default();
        Ok(vec![MetricRecord::new(host, key, value)])
    }
}

fn run(args: &Args) -> Result<bool, Box<dyn std::error::Error>> {
    let records = records(args)?;
    let mut builder = SenderBuilder::new(&args.server)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_nanoseconds(!args.no_ns);
    if args.uses_tls() {
        let mut tls = TlsConfig::new();
        if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
            tls = tls.with_client_cert(cert, key);
        }
        if let Some(ca) = &args.tls_ca {
            tls = tls.with_ca(ca);
        }
        if let Some(name) = &args.tls_server_name {
            tls = tls.with_server_name(name);
        }
        builder = builder.with_tls(tls);
    }
    let sender = builder.build()?;
    debug!(addr = sender.addr(), records = records.len(), "sending");
    let response = sender.send(&records)?;
    println!("Response from \"{}\": \"{}\"", sender.addr(), response.status);
    println!("info from server: \"{}\"", response.info);
    println!(
        "sent: {}; processed: {}; failed: {}",
        records.len(),
        response.processed,
        response.failed
    );
    Ok(response.is_success() && response.failed == 0)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
