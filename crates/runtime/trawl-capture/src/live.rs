//! Live capture through the pnet datalink layer

use crate::source::{FrameSource, Poll};
use crate::{CaptureError, Result};
use chrono::Utc;
use pnet::datalink::{self, Channel, DataLinkReceiver, NetworkInterface};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use trawl_core::{LinkType, RawFrame};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInfo {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub addresses: Vec<String>,
    pub is_up: bool,
    pub is_loopback: bool,
}

impl From<&NetworkInterface> for InterfaceInfo {
    fn from(iface: &NetworkInterface) -> Self {
        Self {
            name: iface.name.clone(),
            description: iface.description.clone(),
            mac: iface.mac.map(|m| m.to_string()),
            addresses: iface.ips.iter().map(|net| net.ip().to_string()).collect(),
            is_up: iface.is_up(),
            is_loopback: iface.is_loopback(),
        }
    }
}

pub fn list_interfaces() -> Vec<InterfaceInfo> {
    datalink::interfaces().iter().map(InterfaceInfo::from).collect()
}

fn open_error(err: io::Error, name: &str) -> CaptureError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied(format!(
            "opening {name} needs capture privileges (root or CAP_NET_RAW): {err}"
        )),
        _ if err.raw_os_error() == Some(1) => CaptureError::PermissionDenied(format!("opening {name}: {err}")),
        _ if err.raw_os_error() == Some(16) => CaptureError::InterfaceBusy(format!("{name}: {err}")),
        _ => CaptureError::Io(err),
    }
}

pub struct LiveSource {
    name: String,
    rx: Box<dyn DataLinkReceiver>,
}

impl LiveSource {
    pub fn open(name: &str, promiscuous: bool, monitor_mode: bool, read_timeout: Duration) -> Result<Self> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| CaptureError::InterfaceNotFound(name.to_string()))?;

        if monitor_mode {
            tracing::warn!(interface = name, "monitor mode must be configured on the interface beforehand");
        }

        let config = datalink::Config {
            read_timeout: Some(read_timeout),
            read_buffer_size: 65536,
            promiscuous,
            ..Default::default()
        };

        match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => {
                tracing::info!(interface = name, promiscuous, "opened live capture");
                Ok(Self { name: name.to_string(), rx })
            }
            Ok(_) => Err(CaptureError::UnsupportedLink(format!("{name} is not an Ethernet-like interface"))),
            Err(err) => Err(open_error(err, name)),
        }
    }
}

impl FrameSource for LiveSource {
    fn next_frame(&mut self) -> Result<Poll> {
        match self.rx.next() {
            Ok(data) => Ok(Poll::Frame(RawFrame {
                timestamp: Utc::now(),
                orig_len: data.len() as u32,
                data: data.to_vec(),
                link_type: LinkType::Ethernet,
            })),
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(Poll::Idle)
            }
            Err(err) => Err(CaptureError::Io(err)),
        }
    }

    fn describe(&self) -> String {
        format!("interface {}", self.name)
    }

    fn is_live(&self) -> bool {
        true
    }
}
