use std::io::BufRead;

use zabbix_sender::MetricRecord;

#[derive(Clone, Copy)]
pub struct Format {
    pub timestamps: bool,
    pub ns: bool,
}

/// Reads `<host> <key> [<clock> [<ns>]] <value>` lines. A `-` host stands for `default_host`.
pub fn read_records<R>(reader: R, default_host: &str, format: Format) -> Result<Vec<MetricRecord>, String>
where
    R: BufRead,
{
    let mut records = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("input error: {}", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = parse_line(&line, default_host, format)
            .map_err(|e| format!("line {}: {}", n + 1, e))?;
        records.push(record);
    }
    Ok(records)
}

fn parse_line(line: &str, default_host: &str, format: Format) -> Result<MetricRecord, String> {
    let fields = split_fields(line)?;
    let expected = 3 + usize::from(format.timestamps) + usize::from(format.timestamps && format.ns);
    if fields.len() != expected {
        return Err(format!("expected {} fields, got {}", expected, fields.len()));
    }
    let mut fields = fields.into_iter();
    let mut next = || fields.next().unwrap_or_default();
    let host = next();
    let host = if host == "-" { default_host.to_owned() } else { host };
    let key = next();
    let mut record = MetricRecord::new(host, key, "");
    if format.timestamps {
        let clock = next();
        record.clock = Some(clock.parse().map_err(|_| format!("invalid timestamp {:?}", clock))?);
        if format.ns {
            let ns = next();
            record.ns = Some(ns.parse().map_err(|_| format!("invalid nanoseconds {:?}", ns))?);
        }
    }
    record.value = next();
    Ok(record)
}

/// Splits on whitespace. Fields may be double-quoted, with `\"` and `\\` escapes inside quotes.
fn split_fields(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(first) = chars.next() else {
            break;
        };
        let mut field = String::new();
        if first == '"' {
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(c @ ('"' | '\\')) => field.push(c),
                        Some(c) => {
                            field.push('\\');
                            field.push(c);
                        }
                        None => return Err("unterminated quote".to_owned()),
                    },
                    Some(c) => field.push(c),
                    None => return Err("unterminated quote".to_owned()),
                }
            }
            if chars.peek().is_some_and(|c| !c.is_whitespace()) {
                return Err("missing separator after quoted field".to_owned());
            }
        } else {
            field.push(first);
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                field.push(c);
            }
        }
        fields.push(field);
    }
    Ok(fields)
}
