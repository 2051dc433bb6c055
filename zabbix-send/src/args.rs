use std::path::PathBuf;

use clap::{ArgGroup, Parser};

#[derive(Parser)]
#[clap(version, about = "Sends values to Zabbix trapper items")]
#[clap(group(ArgGroup::new("input").required(true).args(["key", "input_file"])))]
pub struct Args {
    #[clap(help = "HOST[:PORT], the default port is 10051")]
    pub server: String,
    #[clap(
        short = 's',
        long,
        help = "Host name the values are reported for (defaults to the system host name)"
    )]
    pub host: Option<String>,
    #[clap(short = 'k', long, requires = "value", help = "Item key")]
    pub key: Option<String>,
    #[clap(short = 'o', long, requires = "key", help = "Item value")]
    pub value: Option<String>,
    #[clap(
        short = 'i',
        long,
        value_name = "FILE",
        help = "Load values from FILE ('-' for stdin), one \"<host> <key> <value>\" per line"
    )]
    pub input_file: Option<PathBuf>,
    #[clap(
        short = 'T',
        long,
        requires = "input_file",
        help = "Input lines carry a Unix timestamp before the value"
    )]
    pub with_timestamps: bool,
    #[clap(
        short = 'N',
        long,
        requires = "with_timestamps",
        help = "Input lines carry nanoseconds after the timestamp"
    )]
    pub with_ns: bool,
    #[clap(
        short = 't',
        long,
        help = "Network timeout in seconds, 0 disables it",
        default_value = "10"
    )]
    pub timeout: u64,
    #[clap(long, help = "Do not send the nanosecond part of the request clock")]
    pub no_ns: bool,
    #[clap(long, help = "Connect with TLS")]
    pub tls: bool,
    #[clap(long, requires = "tls_key", help = "Client certificate (PEM), implies --tls")]
    pub tls_cert: Option<PathBuf>,
    #[clap(long, requires = "tls_cert", help = "Client private key (PEM)")]
    pub tls_key: Option<PathBuf>,
    #[clap(long, help = "CA bundle (PEM) the server certificate chain must lead to")]
    pub tls_ca: Option<PathBuf>,
    #[clap(
        long,
        requires = "tls_ca",
        help = "Expected server certificate name, only the chain is verified without it"
    )]
    pub tls_server_name: Option<String>,
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help = "Increase verbosity")]
    pub verbose: u8,
}

impl Args {
    pub fn uses_tls(&self) -> bool {
        self.tls || self.tls_cert.is_some() || self.tls_ca.is_some()
    }
}
