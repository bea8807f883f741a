//! pcap / pcapng trace files
//!
//! Reading stored traces back as frames, exporting packets that kept their
//! raw bytes, and the rotating ring-buffer writer used during live capture.

use crate::source::{FrameSource, Poll};
use crate::{CaptureError, Result};
use chrono::{DateTime, Utc};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapReader, PcapWriter};
use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionBlock;
use pcap_file::pcapng::{Block, PcapNgReader, PcapNgWriter};
use pcap_file::{DataLink, PcapError};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use trawl_core::{LinkType, Packet, RawFrame};

const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];
const PCAP_MAGICS: [[u8; 4]; 4] = [
    [0xd4, 0xc3, 0xb2, 0xa1],
    [0xa1, 0xb2, 0xc3, 0xd4],
    [0x4d, 0x3c, 0xb2, 0xa1],
    [0xa1, 0xb2, 0x3c, 0x4d],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    Pcap,
    PcapNg,
}

impl TraceFormat {
    pub fn detect(magic: &[u8]) -> Option<Self> {
        let head: [u8; 4] = magic.get(..4)?.try_into().ok()?;
        if head == PCAPNG_MAGIC {
            Some(TraceFormat::PcapNg)
        } else if PCAP_MAGICS.contains(&head) {
            Some(TraceFormat::Pcap)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TraceFormat::Pcap => "pcap",
            TraceFormat::PcapNg => "pcapng",
        }
    }
}

fn trace_error(err: PcapError) -> CaptureError {
    match err {
        PcapError::IoError(e) => CaptureError::Io(e),
        other => CaptureError::Trace(other.to_string()),
    }
}

fn link_type(dl: DataLink) -> LinkType {
    match dl {
        DataLink::ETHERNET => LinkType::Ethernet,
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => LinkType::RawIp,
        other => LinkType::Other(u32::from(other)),
    }
}

fn data_link(link: LinkType) -> DataLink {
    match link {
        LinkType::Ethernet => DataLink::ETHERNET,
        LinkType::RawIp => DataLink::RAW,
        LinkType::Other(code) => DataLink::from(code),
    }
}

fn to_datetime(ts: Duration) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.as_secs() as i64, ts.subsec_nanos()).unwrap_or_default()
}

fn to_duration(ts: DateTime<Utc>) -> Duration {
    Duration::new(ts.timestamp().max(0) as u64, ts.timestamp_subsec_nanos())
}

/// Link type a packet was captured with, inferred from its dissection.
fn packet_link(packet: &Packet) -> LinkType {
    if packet.link.is_some() {
        LinkType::Ethernet
    } else {
        LinkType::RawIp
    }
}

enum Reader {
    Pcap { reader: PcapReader<BufReader<File>>, link: LinkType },
    PcapNg { reader: PcapNgReader<BufReader<File>>, links: Vec<LinkType> },
}

/// Replays a trace file, preserving capture timestamps.
pub struct FileSource {
    path: PathBuf,
    reader: Reader,
    frames: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CaptureError::InterfaceNotFound(format!("no such file {}", path.display())),
            _ => CaptureError::Io(e),
        })?;
        let mut buffered = BufReader::new(file);
        let format = TraceFormat::detect(buffered.fill_buf()?)
            .ok_or_else(|| CaptureError::Trace(format!("{} is neither pcap nor pcapng", path.display())))?;

        let reader = match format {
            TraceFormat::Pcap => {
                let reader = PcapReader::new(buffered).map_err(trace_error)?;
                let link = link_type(reader.header().datalink);
                Reader::Pcap { reader, link }
            }
            TraceFormat::PcapNg => {
                let reader = PcapNgReader::new(buffered).map_err(trace_error)?;
                Reader::PcapNg { reader, links: Vec::new() }
            }
        };

        tracing::info!(path = %path.display(), ?format, "opened trace file");
        Ok(Self { path: path.to_path_buf(), reader, frames: 0 })
    }

    pub fn frames_read(&self) -> u64 {
        self.frames
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self) -> Result<Poll> {
        let frame = match &mut self.reader {
            Reader::Pcap { reader, link } => match reader.next_packet() {
                None => None,
                Some(packet) => {
                    let packet = packet.map_err(trace_error)?;
                    Some(RawFrame {
                        timestamp: to_datetime(packet.timestamp),
                        data: packet.data.into_owned(),
                        orig_len: packet.orig_len,
                        link_type: *link,
                    })
                }
            },
            Reader::PcapNg { reader, links } => loop {
                let block = match reader.next_block() {
                    None => break None,
                    Some(block) => block.map_err(trace_error)?,
                };
                match block {
                    Block::InterfaceDescription(idb) => links.push(link_type(idb.linktype)),
                    Block::EnhancedPacket(epb) => {
                        let link = links.get(epb.interface_id as usize).copied().unwrap_or(LinkType::Ethernet);
                        break Some(RawFrame {
                            timestamp: to_datetime(epb.timestamp),
                            orig_len: epb.original_len,
                            data: epb.data.into_owned(),
                            link_type: link,
                        });
                    }
                    Block::SimplePacket(spb) => {
                        let link = links.first().copied().unwrap_or(LinkType::Ethernet);
                        break Some(RawFrame {
                            timestamp: Utc::now(),
                            orig_len: spb.original_len,
                            data: spb.data.into_owned(),
                            link_type: link,
                        });
                    }
                    _ => continue,
                }
            },
        };

        Ok(match frame {
            Some(frame) => {
                self.frames += 1;
                Poll::Frame(frame)
            }
            None => Poll::End,
        })
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Read a whole trace file into memory.
pub fn read_trace(path: &Path) -> Result<Vec<RawFrame>> {
    let mut source = FileSource::open(path)?;
    let mut frames = Vec::new();
    loop {
        match source.next_frame()? {
            Poll::Frame(frame) => frames.push(frame),
            Poll::Idle => continue,
            Poll::End => return Ok(frames),
        }
    }
}

/// Write packets as classic pcap. Packets without raw bytes, or with a
/// different link type than the first one, are skipped. Returns the number
/// of packets written.
pub fn write_pcap<W: Write>(writer: &mut W, packets: &[Arc<Packet>]) -> Result<usize> {
    let link = packets
        .iter()
        .find(|p| p.raw.is_some())
        .map(|p| packet_link(p))
        .unwrap_or(LinkType::Ethernet);
    let header = PcapHeader { datalink: data_link(link), ..Default::default() };
    let mut out = PcapWriter::with_header(writer, header).map_err(trace_error)?;

    let mut written = 0;
    for packet in packets {
        let Some(raw) = &packet.raw else { continue };
        if packet_link(packet) != link {
            continue;
        }
        let record = PcapPacket::new(to_duration(packet.timestamp), packet.length as u32, raw);
        out.write_packet(&record).map_err(trace_error)?;
        written += 1;
    }
    Ok(written)
}

/// Write packets as pcapng, one interface block per link type seen.
pub fn write_pcapng<W: Write>(writer: &mut W, packets: &[Arc<Packet>]) -> Result<usize> {
    let mut out = PcapNgWriter::new(writer).map_err(trace_error)?;
    let mut interfaces: Vec<LinkType> = Vec::new();

    let mut written = 0;
    for packet in packets {
        let Some(raw) = &packet.raw else { continue };
        let link = packet_link(packet);
        let interface_id = match interfaces.iter().position(|l| *l == link) {
            Some(id) => id,
            None => {
                let idb = InterfaceDescriptionBlock { linktype: data_link(link), snaplen: 0xFFFF, options: vec![] };
                out.write_block(&Block::InterfaceDescription(idb)).map_err(trace_error)?;
                interfaces.push(link);
                interfaces.len() - 1
            }
        };
        let epb = EnhancedPacketBlock {
            interface_id: interface_id as u32,
            timestamp: to_duration(packet.timestamp),
            original_len: packet.length as u32,
            data: Cow::Borrowed(raw.as_slice()),
            options: vec![],
        };
        out.write_block(&Block::EnhancedPacket(epb)).map_err(trace_error)?;
        written += 1;
    }
    Ok(written)
}

struct RingFile {
    writer: PcapWriter<BufWriter<File>>,
    size: u64,
    link: LinkType,
}

/// Rotating set of pcap files.
///
/// Files are named `trawl_<index>_<timestamp>.pcap`. A file is rotated once
/// it reaches `max_file_size` bytes and at most `max_files` are kept, oldest
/// deleted first. Zero limits mean unlimited.
pub struct RingWriter {
    dir: PathBuf,
    max_file_size: u64,
    max_files: usize,
    index: u64,
    files: VecDeque<PathBuf>,
    current: Option<RingFile>,
}

/// pcap global header
const HEADER_LEN: u64 = 24;
/// pcap per-record header
const RECORD_LEN: u64 = 16;

impl RingWriter {
    pub fn new(dir: &Path, max_file_size: u64, max_files: usize) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_size,
            max_files,
            index: 0,
            files: VecDeque::new(),
            current: None,
        })
    }

    /// Append a frame. Returns the path of a newly opened file when this
    /// write rotated to one.
    pub fn write(&mut self, frame: &RawFrame) -> Result<Option<PathBuf>> {
        let full = self
            .current
            .as_ref()
            .is_some_and(|c| self.max_file_size > 0 && c.size >= self.max_file_size);
        let relinked = self.current.as_ref().is_some_and(|c| c.link != frame.link_type);

        let mut rotated = None;
        if self.current.is_none() || full || relinked {
            rotated = Some(self.open_next(frame)?);
        }

        if let Some(current) = self.current.as_mut() {
            let packet = PcapPacket::new(to_duration(frame.timestamp), frame.orig_len, &frame.data);
            current.writer.write_packet(&packet).map_err(trace_error)?;
            current.size += RECORD_LEN + frame.data.len() as u64;
        }
        Ok(rotated)
    }

    fn open_next(&mut self, frame: &RawFrame) -> Result<PathBuf> {
        // dropping the previous writer flushes it
        self.current = None;
        self.index += 1;
        let name = format!("trawl_{:05}_{}.pcap", self.index, frame.timestamp.format("%Y%m%d%H%M%S"));
        let path = self.dir.join(name);

        let header = PcapHeader { datalink: data_link(frame.link_type), ..Default::default() };
        let writer = PcapWriter::with_header(BufWriter::new(File::create(&path)?), header).map_err(trace_error)?;
        self.current = Some(RingFile { writer, size: HEADER_LEN, link: frame.link_type });
        self.files.push_back(path.clone());

        while self.max_files > 0 && self.files.len() > self.max_files {
            if let Some(oldest) = self.files.pop_front() {
                if let Err(e) = fs::remove_file(&oldest) {
                    tracing::warn!(path = %oldest.display(), error = %e, "could not delete old ring file");
                }
            }
        }

        tracing::debug!(path = %path.display(), "opened ring file");
        Ok(path)
    }

    /// Files currently kept on disk, oldest first.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(PathBuf::as_path)
    }
}
