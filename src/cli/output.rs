//! Event output.
//!
//! Each event becomes one line: capture time, the source and destination
//! ancestry of its context, the event name and a short summary. The verbose
//! format follows the line with a hex dump of the payload bytes.

use std::io::{self, Write};

use clap::ValueEnum;
use crossbeam::channel::Receiver;
use flowprobe_core::{Event, EventPayload};

/// Bytes per hex dump row.
const DUMP_WIDTH: usize = 16;

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One line per event (default)
    Text,
    /// One line per event followed by a hex dump of its payload
    Verbose,
}

/// Formats events for output.
pub struct EventFormatter {
    format: OutputFormat,
}

impl EventFormatter {
    /// Create a new formatter with the specified format.
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Format one event and write it to the given writer.
    pub fn write<W: Write>(&self, event: &Event, writer: &mut W) -> io::Result<()> {
        let summary = summarize(&event.payload);
        write!(
            writer,
            "{} {} -> {} {}",
            format_timestamp(event.timestamp_us),
            event.context.describe_src(),
            event.context.describe_dest(),
            event.payload.name()
        )?;
        if summary.is_empty() {
            writeln!(writer)?;
        } else {
            writeln!(writer, " {summary}")?;
        }

        if self.format == OutputFormat::Verbose {
            if let Some(data) = event.payload.data() {
                hex_dump(data, writer)?;
            }
        }
        Ok(())
    }
}

/// Drain `events` until every producer has gone, writing each one.
/// Returns the number of events written.
pub fn consume<W: Write>(
    events: Receiver<Event>,
    formatter: &EventFormatter,
    writer: &mut W,
) -> io::Result<u64> {
    let mut count = 0;
    for event in events.iter() {
        formatter.write(&event, writer)?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

/// `seconds.microseconds` since the epoch.
fn format_timestamp(timestamp_us: i64) -> String {
    format!(
        "{}.{:06}",
        timestamp_us.div_euclid(1_000_000),
        timestamp_us.rem_euclid(1_000_000)
    )
}

fn hex_dump<W: Write>(data: &[u8], writer: &mut W) -> io::Result<()> {
    for (row, chunk) in data.chunks(DUMP_WIDTH).enumerate() {
        let encoded = hex::encode(chunk);
        let bytes: Vec<&str> = (0..chunk.len())
            .map(|i| &encoded[i * 2..i * 2 + 2])
            .collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        writeln!(
            writer,
            "    {:04x}  {:<width$}  {}",
            row * DUMP_WIDTH,
            bytes.join(" "),
            ascii,
            width = DUMP_WIDTH * 3 - 1
        )?;
    }
    Ok(())
}

/// Short human-readable details for an event.
pub fn summarize(payload: &EventPayload) -> String {
    match payload {
        EventPayload::ConnectionUp
        | EventPayload::ConnectionDown
        | EventPayload::TlsServerHelloDone
        | EventPayload::TlsChangeCipherSpec => String::new(),
        EventPayload::UnrecognisedStream { data, position } => {
            format!("position={position} len={}", data.len())
        }
        EventPayload::UnrecognisedDatagram { data } | EventPayload::Rtp { data } => {
            format!("len={}", data.len())
        }
        EventPayload::UnrecognisedIpProtocol { protocol, data } => {
            format!("protocol={protocol} len={}", data.len())
        }
        EventPayload::Icmp { kind, code, data } => {
            format!("type={kind} code={code} len={}", data.len())
        }
        EventPayload::HttpRequest { method, url, .. } => format!("{method} {url}"),
        EventPayload::HttpResponse {
            code, status, url, ..
        } => match url {
            Some(url) => format!("{code} {status} for {url}"),
            None => format!("{code} {status}"),
        },
        EventPayload::DnsMessage(message) => {
            let names: Vec<&str> = message.queries.iter().map(|q| q.name.as_str()).collect();
            format!(
                "id=0x{:04x} {} {} answers={} rcode={}",
                message.header.id,
                if message.header.qr { "response" } else { "query" },
                names.join(","),
                message.answers.len(),
                message.header.rcode
            )
        }
        EventPayload::SmtpCommand { command } | EventPayload::FtpCommand { command } => {
            command.clone()
        }
        EventPayload::SmtpResponse { status, text } | EventPayload::FtpResponse { status, text } => {
            format!("{status} {}", text.join(" / "))
        }
        EventPayload::SmtpData { from, to, data } => {
            format!("from={from} to={} len={}", to.join(","), data.len())
        }
        EventPayload::SipRequest { method, from, to, .. } => {
            format!("{method} from={from} to={to}")
        }
        EventPayload::SipResponse {
            code,
            status,
            from,
            to,
            ..
        } => format!("{code} {status} from={from} to={to}"),
        EventPayload::Opaque { protocol, data } => {
            format!("protocol={protocol} len={}", data.len())
        }
        EventPayload::TlsClientHello {
            version,
            cipher_suites,
            server_name,
            alpn,
        } => format!(
            "version=0x{version:04x} sni={} alpn={} suites={}",
            server_name.as_deref().unwrap_or("-"),
            if alpn.is_empty() { "-".to_string() } else { alpn.join(",") },
            cipher_suites.len()
        ),
        EventPayload::TlsServerHello {
            version,
            cipher_suite,
        } => format!("version=0x{version:04x} cipher_suite=0x{cipher_suite:04x}"),
        EventPayload::TlsCertificates { certificates } => {
            format!("count={}", certificates.len())
        }
        EventPayload::TlsHandshake { msg_type } => format!("type={msg_type}"),
        EventPayload::TlsApplicationData { length } => format!("len={length}"),
        EventPayload::TlsAlert { level, description } => {
            format!("level={level} description={description}")
        }
        EventPayload::TlsUnknown { content_type } => format!("content_type={content_type}"),
        EventPayload::NtpTimestamp(ntp) => format!(
            "v{} mode={} stratum={} transmit={:.6}",
            ntp.header.version, ntp.header.mode, ntp.stratum, ntp.transmit_timestamp
        ),
        EventPayload::NtpControl(ntp) => format!(
            "v{} opcode={} sequence={} {}",
            ntp.header.version,
            ntp.opcode,
            ntp.sequence,
            if ntp.is_response { "response" } else { "request" }
        ),
        EventPayload::NtpPrivate(ntp) => format!(
            "v{} implementation={} request_code={}",
            ntp.header.version, ntp.implementation, ntp.request_code
        ),
        EventPayload::Gre {
            next_proto,
            key,
            data,
            ..
        } => match key {
            Some(key) => format!("proto=0x{next_proto:04x} key={key} len={}", data.len()),
            None => format!("proto=0x{next_proto:04x} len={}", data.len()),
        },
        EventPayload::GrePptp { call_id, data, .. } => {
            format!("call_id={call_id} len={}", data.len())
        }
        EventPayload::Esp {
            spi,
            sequence,
            length,
        } => format!("spi=0x{spi:08x} sequence={sequence} len={length}"),
    }
}
