use std::env;

use zabbix_sender::{make_records, SenderBuilder, Value};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let server = env::args().nth(1).unwrap_or_else(|| "localhost:10051".to_owned());
    let sender = SenderBuilder::new(server).build()?;
    // clock left unset: the collector stamps the values on receipt
    let records = make_records(
        "localhost",
        [("rpm", Value::from(42.12)), ("errors", Value::from(1))],
        None,
    );
    let response = sender.send(&records)?;
    println!(
        "{}: processed {}, failed {} ({})",
        response.status, response.processed, response.failed, response.info
    );
    Ok(())
}
