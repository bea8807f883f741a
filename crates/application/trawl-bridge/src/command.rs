//! Bridge commands
//!
//! Every request is `{"method": "<name>", "params": {...}}`. Methods without
//! parameters may omit `params`; so may methods whose parameters all have
//! defaults.

use crate::export::ExportFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use trawl_analysis::ConversationKind;
use trawl_capture::CaptureOptions;
use trawl_core::HttpRequest;
use trawl_proxy::{HistoryFilter, ProxySettings};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Command {
    // Capture
    GetInterfaces,
    StartCapture {
        device: String,
        #[serde(default)]
        options: CaptureOptions,
    },
    StopCapture,
    LoadPcapFile {
        path: PathBuf,
    },

    // Packets
    GetPackets {
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        start: Option<u64>,
        #[serde(default)]
        end: Option<u64>,
    },
    GetPacket {
        no: u64,
    },
    ClearPackets,
    ExportPackets {
        format: ExportFormat,
        path: PathBuf,
        #[serde(default)]
        filter: Option<String>,
    },
    ImportPackets {
        path: PathBuf,
    },

    // Statistics
    GetProtocolHierarchy,
    GetConversations {
        #[serde(rename = "type", default)]
        kind: ConversationKind,
    },
    GetEndpoints {
        #[serde(rename = "type", default)]
        kind: ConversationKind,
    },
    #[serde(rename = "getIOGraph")]
    GetIoGraph {
        /// Bucket width in seconds
        #[serde(default)]
        interval: Option<f64>,
    },
    #[serde(rename = "getTCPStreams")]
    GetTcpStreams,
    GetPacketLengthStats,

    // Alerts
    GetExpertAlerts,
    GetSecurityAlerts,

    // Proxy
    StartProxy {
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        settings: Option<ProxySettings>,
    },
    StopProxy,
    ToggleIntercept {
        enabled: bool,
    },
    ForwardIntercept {
        id: String,
        /// Edited request; the held one is forwarded when absent
        #[serde(default)]
        request: Option<HttpRequest>,
    },
    DropIntercept {
        id: String,
    },
    GetPendingIntercepts,
    GetProxyHistory {
        #[serde(default)]
        filters: HistoryFilter,
    },
    ClearProxyHistory,
    RepeatRequest {
        request: HttpRequest,
    },

    // Interception CA
    #[serde(rename = "generateCACertificate")]
    GenerateCaCertificate,
    #[serde(rename = "exportCACertificate")]
    ExportCaCertificate {
        path: PathBuf,
    },
    #[serde(rename = "installCACertificate")]
    InstallCaCertificate,
}

impl Command {
    /// Decode a request object, tolerating a missing `params` for methods
    /// whose parameters are all optional.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        match serde_json::from_value::<Command>(value.clone()) {
            Ok(command) => Ok(command),
            Err(err) => {
                let Value::Object(mut object) = value else { return Err(err) };
                if object.contains_key("params") {
                    return Err(err);
                }
                object.insert("params".to_string(), Value::Object(Default::default()));
                serde_json::from_value(Value::Object(object)).map_err(|_| err)
            }
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Command::GetInterfaces => "getInterfaces",
            Command::StartCapture { .. } => "startCapture",
            Command::StopCapture => "stopCapture",
            Command::LoadPcapFile { .. } => "loadPcapFile",
            Command::GetPackets { .. } => "getPackets",
            Command::GetPacket { .. } => "getPacket",
            Command::ClearPackets => "clearPackets",
            Command::ExportPackets { .. } => "exportPackets",
            Command::ImportPackets { .. } => "importPackets",
            Command::GetProtocolHierarchy => "getProtocolHierarchy",
            Command::GetConversations { .. } => "getConversations",
            Command::GetEndpoints { .. } => "getEndpoints",
            Command::GetIoGraph { .. } => "getIOGraph",
            Command::GetTcpStreams => "getTCPStreams",
            Command::GetPacketLengthStats => "getPacketLengthStats",
            Command::GetExpertAlerts => "getExpertAlerts",
            Command::GetSecurityAlerts => "getSecurityAlerts",
            Command::StartProxy { .. } => "startProxy",
            Command::StopProxy => "stopProxy",
            Command::ToggleIntercept { .. } => "toggleIntercept",
            Command::ForwardIntercept { .. } => "forwardIntercept",
            Command::DropIntercept { .. } => "dropIntercept",
            Command::GetPendingIntercepts => "getPendingIntercepts",
            Command::GetProxyHistory { .. } => "getProxyHistory",
            Command::ClearProxyHistory => "clearProxyHistory",
            Command::RepeatRequest { .. } => "repeatRequest",
            Command::GenerateCaCertificate => "generateCACertificate",
            Command::ExportCaCertificate { .. } => "exportCACertificate",
            Command::InstallCaCertificate => "installCACertificate",
        }
    }
}
