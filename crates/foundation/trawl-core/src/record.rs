//! Common view over stored items, used by indices and filters.

use crate::alert::ItemRef;
use crate::packet::Packet;
use crate::transaction::ProxyTransaction;

pub trait Record: Send + Sync + 'static {
    fn no(&self) -> u64;
    fn set_no(&mut self, no: u64);
    fn source(&self) -> &str;
    fn destination(&self) -> &str;
    fn src_port(&self) -> Option<u16>;
    fn dst_port(&self) -> Option<u16>;
    fn protocol(&self) -> &str;
    fn app_protocol(&self) -> Option<&str>;
    /// Free text searched by substring filters
    fn info(&self) -> String;
    fn item_ref(&self) -> ItemRef;
}

impl Record for Packet {
    fn no(&self) -> u64 {
        self.no
    }

    fn set_no(&mut self, no: u64) {
        self.no = no;
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    fn src_port(&self) -> Option<u16> {
        self.src_port
    }

    fn dst_port(&self) -> Option<u16> {
        self.dst_port
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn app_protocol(&self) -> Option<&str> {
        self.app_protocol.as_deref()
    }

    fn info(&self) -> String {
        self.info.clone()
    }

    fn item_ref(&self) -> ItemRef {
        ItemRef::Packet(self.no)
    }
}

impl Record for ProxyTransaction {
    fn no(&self) -> u64 {
        self.no
    }

    fn set_no(&mut self, no: u64) {
        self.no = no;
    }

    fn source(&self) -> &str {
        &self.client
    }

    fn destination(&self) -> &str {
        &self.host
    }

    fn src_port(&self) -> Option<u16> {
        Some(self.client_port)
    }

    fn dst_port(&self) -> Option<u16> {
        Some(self.port)
    }

    fn protocol(&self) -> &str {
        match self.scheme {
            crate::Scheme::Http => "HTTP",
            crate::Scheme::Https => "HTTPS",
        }
    }

    fn app_protocol(&self) -> Option<&str> {
        None
    }

    fn info(&self) -> String {
        self.summary()
    }

    fn item_ref(&self) -> ItemRef {
        ItemRef::Transaction(self.no)
    }
}
