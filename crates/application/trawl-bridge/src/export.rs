//! Packet export and import
//!
//! Text formats carry the summary columns (and, for PDML/text, the decoded
//! layers); pcap and pcapng need the raw frame bytes and skip packets that
//! were stored without them. Only JSON exports can be imported back.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use trawl_core::{Packet, Result, TrawlError};

const CREATOR: &str = concat!("trawl/", env!("CARGO_PKG_VERSION"));
const CSV_HEADER: &str = "No,Time,Source,Destination,Protocol,Length,Info";
const PS_LINES_PER_PAGE: usize = 64;
const PS_LINE_WIDTH: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Xml,
    Psml,
    Pdml,
    Txt,
    Ps,
    Pcap,
    Pcapng,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 9] = [
        ExportFormat::Json,
        ExportFormat::Csv,
        ExportFormat::Xml,
        ExportFormat::Psml,
        ExportFormat::Pdml,
        ExportFormat::Txt,
        ExportFormat::Ps,
        ExportFormat::Pcap,
        ExportFormat::Pcapng,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Xml => "xml",
            ExportFormat::Psml => "psml",
            ExportFormat::Pdml => "pdml",
            ExportFormat::Txt => "txt",
            ExportFormat::Ps => "ps",
            ExportFormat::Pcap => "pcap",
            ExportFormat::Pcapng => "pcapng",
        }
    }

    /// Guess the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension().and_then(|ext| ext.to_str()).and_then(|ext| ext.parse().ok())
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        ExportFormat::ALL
            .into_iter()
            .find(|format| format.extension() == lower)
            .ok_or_else(|| format!("unknown export format '{s}'"))
    }
}

/// Write `packets` to `writer`. Returns the number of packets written.
pub fn write_packets<W: Write>(format: ExportFormat, packets: &[Arc<Packet>], writer: &mut W) -> Result<usize> {
    match format {
        ExportFormat::Pcap => return Ok(trawl_capture::write_pcap(writer, packets)?),
        ExportFormat::Pcapng => return Ok(trawl_capture::write_pcapng(writer, packets)?),
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut *writer, packets)
                .map_err(|e| TrawlError::Internal(format!("json export: {e}")))?;
            writer.write_all(b"\n")?;
            return Ok(packets.len());
        }
        ExportFormat::Csv => {
            write_csv(packets, writer)?;
            return Ok(packets.len());
        }
        _ => {}
    }

    let text = match format {
        ExportFormat::Xml => xml(packets),
        ExportFormat::Psml => psml(packets),
        ExportFormat::Pdml => pdml(packets),
        ExportFormat::Txt => text(packets),
        _ => postscript(packets),
    };
    writer.write_all(text.as_bytes())?;
    Ok(packets.len())
}

/// Create `path` and export into it.
pub fn export_file(format: ExportFormat, packets: &[Arc<Packet>], path: &Path) -> Result<usize> {
    let file = File::create(path).map_err(|e| TrawlError::from_io(e, path.display()))?;
    let mut writer = BufWriter::new(file);
    let written = write_packets(format, packets, &mut writer)?;
    writer.flush().map_err(|e| TrawlError::from_io(e, path.display()))?;
    tracing::info!(path = %path.display(), %format, written, "packets exported");
    Ok(written)
}

/// Read a JSON export.
pub fn import_file(path: &Path) -> Result<Vec<Packet>> {
    let file = File::open(path).map_err(|e| TrawlError::from_io(e, path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| TrawlError::InvalidInput(format!("{} is not a JSON packet export: {e}", path.display())))
}

fn write_csv<W: Write>(packets: &[Arc<Packet>], writer: &mut W) -> Result<()> {
    let mut out = csv::WriterBuilder::new().quote_style(csv::QuoteStyle::Necessary).from_writer(writer);
    out.write_record(CSV_HEADER.split(',')).map_err(csv_error)?;
    for p in packets {
        let no = p.no.to_string();
        let time = format!("{:.6}", p.relative_time);
        let length = p.length.to_string();
        out.write_record([
            no.as_str(),
            time.as_str(),
            p.source.as_str(),
            p.destination.as_str(),
            p.display_protocol(),
            length.as_str(),
            p.info.as_str(),
        ])
        .map_err(csv_error)?;
    }
    out.flush()?;
    Ok(())
}

fn csv_error(err: csv::Error) -> TrawlError {
    TrawlError::Internal(format!("csv export: {err}"))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if c.is_control() && c != '\t' => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

fn xml(packets: &[Arc<Packet>]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(out, "<packets creator=\"{CREATOR}\" count=\"{}\">", packets.len());
    for p in packets {
        let _ = writeln!(out, "  <packet no=\"{}\">", p.no);
        let _ = writeln!(out, "    <timestamp>{}</timestamp>", p.timestamp.to_rfc3339());
        let _ = writeln!(out, "    <relativeTime>{:.6}</relativeTime>", p.relative_time);
        let _ = writeln!(out, "    <source>{}</source>", escape(&p.source));
        let _ = writeln!(out, "    <destination>{}</destination>", escape(&p.destination));
        if let Some(port) = p.src_port {
            let _ = writeln!(out, "    <srcPort>{port}</srcPort>");
        }
        if let Some(port) = p.dst_port {
            let _ = writeln!(out, "    <dstPort>{port}</dstPort>");
        }
        let _ = writeln!(out, "    <protocol>{}</protocol>", escape(&p.protocol));
        if let Some(app) = &p.app_protocol {
            let _ = writeln!(out, "    <appProtocol>{}</appProtocol>", escape(app));
        }
        let _ = writeln!(out, "    <length>{}</length>", p.length);
        let _ = writeln!(out, "    <info>{}</info>", escape(&p.info));
        out.push_str("  </packet>\n");
    }
    out.push_str("</packets>\n");
    out
}

fn psml(packets: &[Arc<Packet>]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n");
    let _ = writeln!(out, "<psml version=\"0\" creator=\"{CREATOR}\">");
    out.push_str("<structure>\n");
    for column in CSV_HEADER.split(',') {
        let _ = writeln!(out, "<section>{column}</section>");
    }
    out.push_str("</structure>\n\n");
    for p in packets {
        out.push_str("<packet>\n");
        let sections = [
            p.no.to_string(),
            format!("{:.6}", p.relative_time),
            escape(&p.source),
            escape(&p.destination),
            escape(p.display_protocol()),
            p.length.to_string(),
            escape(&p.info),
        ];
        for section in sections {
            let _ = writeln!(out, "<section>{section}</section>");
        }
        out.push_str("</packet>\n\n");
    }
    out.push_str("</psml>\n");
    out
}

struct Proto<'a> {
    out: &'a mut String,
}

impl Proto<'_> {
    fn open<'a>(out: &'a mut String, name: &str, showname: &str, size: usize) -> Proto<'a> {
        let _ = writeln!(out, "  <proto name=\"{name}\" showname=\"{}\" size=\"{size}\">", escape(showname));
        Proto { out }
    }

    fn field(&mut self, name: &str, show: impl fmt::Display) -> &mut Self {
        let show = escape(&show.to_string());
        let _ = writeln!(self.out, "    <field name=\"{name}\" show=\"{show}\"/>");
        self
    }

    fn close(self) {
        self.out.push_str("  </proto>\n");
    }
}

fn pdml(packets: &[Arc<Packet>]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    let _ = writeln!(out, "<pdml version=\"0\" creator=\"{CREATOR}\">");
    for p in packets {
        out.push_str("<packet>\n");
        let mut info = Proto::open(&mut out, "geninfo", "General information", p.length);
        info.field("num", p.no)
            .field("len", p.length)
            .field("timestamp", p.timestamp.to_rfc3339())
            .field("time_relative", format!("{:.6}", p.relative_time));
        info.close();

        let mut frame = Proto::open(&mut out, "frame", &format!("Frame {}: {} bytes", p.no, p.length), p.length);
        frame.field("frame.protocols", protocol_stack(p));
        if let Some(raw) = &p.raw {
            frame.field("frame.raw", hex::encode(raw));
        }
        frame.close();

        if let Some(link) = &p.link {
            let mut eth = Proto::open(&mut out, "eth", &format!("Ethernet II, Src: {}, Dst: {}", link.src_mac, link.dst_mac), 14);
            eth.field("eth.src", &link.src_mac)
                .field("eth.dst", &link.dst_mac)
                .field("eth.type", format!("0x{:04x}", link.ethertype));
            eth.close();
        }

        if let Some(arp) = &p.arp {
            let mut proto = Proto::open(&mut out, "arp", "Address Resolution Protocol", 28);
            proto
                .field("arp.opcode", arp.operation)
                .field("arp.src.hw_mac", &arp.sender_mac)
                .field("arp.src.proto_ipv4", &arp.sender_ip)
                .field("arp.dst.hw_mac", &arp.target_mac)
                .field("arp.dst.proto_ipv4", &arp.target_ip);
            proto.close();
        } else if let (Some(src), Some(dst)) = (p.source_ip(), p.destination_ip()) {
            let (name, label) = if src.is_ipv6() { ("ipv6", "Internet Protocol Version 6") } else { ("ip", "Internet Protocol Version 4") };
            let mut ip = Proto::open(&mut out, name, &format!("{label}, Src: {src}, Dst: {dst}"), 0);
            ip.field(&format!("{name}.src"), src).field(&format!("{name}.dst"), dst);
            if let Some(ttl) = p.ttl {
                ip.field(&format!("{name}.ttl"), ttl);
            }
            ip.close();
        }

        if let (Some(sport), Some(dport)) = (p.src_port, p.dst_port) {
            let name = p.protocol.to_ascii_lowercase();
            let mut transport = Proto::open(&mut out, &name, &format!("{}, Src Port: {sport}, Dst Port: {dport}", p.protocol), 0);
            transport.field(&format!("{name}.srcport"), sport).field(&format!("{name}.dstport"), dport);
            if let Some(tcp) = &p.tcp {
                transport
                    .field("tcp.seq", tcp.seq)
                    .field("tcp.ack", tcp.ack)
                    .field("tcp.flags", format!("0x{:03x}", tcp.flags.0))
                    .field("tcp.flags.str", tcp.flags.names().join(","))
                    .field("tcp.window_size", tcp.window)
                    .field("tcp.len", tcp.payload_len);
            }
            transport.close();
        }

        if let Some(app) = &p.app_protocol {
            let mut proto = Proto::open(&mut out, &app.to_ascii_lowercase(), app, p.payload().len());
            proto.field(&format!("{}.info", app.to_ascii_lowercase()), &p.info);
            proto.close();
        }
        out.push_str("</packet>\n");
    }
    out.push_str("</pdml>\n");
    out
}

fn protocol_stack(p: &Packet) -> String {
    let mut layers = Vec::new();
    if p.link.is_some() {
        layers.push("eth".to_string());
    }
    if p.arp.is_some() {
        layers.push("arp".to_string());
    } else if let Some(ip) = p.source_ip() {
        layers.push(if ip.is_ipv6() { "ipv6" } else { "ip" }.to_string());
    }
    if p.src_port.is_some() || p.tcp.is_some() {
        layers.push(p.protocol.to_ascii_lowercase());
    }
    if let Some(app) = &p.app_protocol {
        layers.push(app.to_ascii_lowercase());
    }
    layers.join(":")
}

fn summary_header() -> String {
    format!("{:>6} {:>12} {:<39} {:<39} {:<8} {:>6} Info", "No.", "Time", "Source", "Destination", "Protocol", "Length")
}

fn summary(p: &Packet) -> String {
    format!(
        "{:>6} {:>12.6} {:<39} {:<39} {:<8} {:>6} {}",
        p.no,
        p.relative_time,
        p.source,
        p.destination,
        p.display_protocol(),
        p.length,
        p.info
    )
}

fn hex_dump(out: &mut String, data: &[u8]) {
    for (row, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        let _ = writeln!(out, "{:04x}  {:<47}  {ascii}", row * 16, hex.join(" "));
    }
}

fn text(packets: &[Arc<Packet>]) -> String {
    let mut out = String::new();
    for p in packets {
        out.push_str(&summary_header());
        out.push('\n');
        out.push_str(&summary(p));
        out.push_str("\n\n");
        let _ = writeln!(out, "Frame {}: {} bytes captured at {}", p.no, p.length, p.timestamp.to_rfc3339());
        if let Some(link) = &p.link {
            let _ = writeln!(out, "Ethernet II, Src: {}, Dst: {}", link.src_mac, link.dst_mac);
        }
        if let Some(arp) = &p.arp {
            let _ = writeln!(out, "ARP, {} ({}) → {} ({})", arp.sender_ip, arp.sender_mac, arp.target_ip, arp.target_mac);
        } else if p.source_ip().is_some() {
            let _ = writeln!(out, "Internet Protocol, Src: {}, Dst: {}", p.source, p.destination);
        }
        if let (Some(sport), Some(dport)) = (p.src_port, p.dst_port) {
            let _ = writeln!(out, "{}, Src Port: {sport}, Dst Port: {dport}", p.protocol);
        }
        if let Some(tcp) = &p.tcp {
            let _ = writeln!(
                out,
                "    Seq: {}  Ack: {}  Flags: [{}]  Win: {}  Len: {}",
                tcp.seq,
                tcp.ack,
                tcp.flags.names().join(", "),
                tcp.window,
                tcp.payload_len
            );
        }
        if let Some(raw) = &p.raw {
            out.push('\n');
            hex_dump(&mut out, raw);
        }
        out.push('\n');
    }
    out
}

fn ps_string(line: &str) -> String {
    let mut out = String::with_capacity(line.len() + 2);
    out.push('(');
    for c in line.chars().take(PS_LINE_WIDTH) {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            _ => out.push('?'),
        }
    }
    out.push(')');
    out
}

fn postscript(packets: &[Arc<Packet>]) -> String {
    let mut lines = vec![summary_header()];
    lines.extend(packets.iter().map(|p| summary(p)));
    let pages: Vec<&[String]> = lines.chunks(PS_LINES_PER_PAGE).collect();

    let mut out = String::from("%!PS-Adobe-3.0\n");
    out.push_str("%%Title: trawl packet export\n");
    let _ = writeln!(out, "%%Creator: {CREATOR}");
    let _ = writeln!(out, "%%Pages: {}", pages.len());
    out.push_str("%%EndComments\n");
    out.push_str("/line { 36 exch moveto show } def\n");

    for (index, page) in pages.iter().enumerate() {
        let _ = writeln!(out, "%%Page: {0} {0}", index + 1);
        out.push_str("/Courier findfont 6 scalefont setfont\n");
        for (row, line) in page.iter().enumerate() {
            let _ = writeln!(out, "{} {} line", ps_string(line), 770 - row * 11);
        }
        out.push_str("showpage\n");
    }
    out.push_str("%%EOF\n");
    out
}
