//! Proxy configuration synthesis
//!
//! Renders a [`ConfigSnapshot`] into an nginx `stream {}` include file. The
//! output depends only on the snapshot and the fixed renderer settings, so
//! comparing two rendered documents is a reliable "nothing changed" test.

use fullcone_proto::ConfigSnapshot;
use std::fmt::Write;
use std::net::{IpAddr, SocketAddr};

const HEADER: &str = "# generated by fullcone; do not edit\n";

#[derive(Debug, Clone, Default)]
pub struct NginxRenderer {
    /// Directives inserted verbatim into every server block
    additional_conf: String,
    /// Replaces the per-allocation listen address when set
    listen_address: Option<IpAddr>,
}

impl NginxRenderer {
    pub fn new(additional_conf: impl Into<String>) -> Self {
        Self {
            additional_conf: additional_conf.into().trim().to_string(),
            listen_address: None,
        }
    }

    pub fn with_listen_address(mut self, listen_address: Option<IpAddr>) -> Self {
        self.listen_address = listen_address;
        self
    }

    pub fn render(&self, snapshot: &ConfigSnapshot) -> String {
        let mut out = String::with_capacity(HEADER.len() + snapshot.len() * 96);
        out.push_str(HEADER);

        let extra = if self.additional_conf.is_empty() {
            String::new()
        } else {
            format!("{} ", self.additional_conf)
        };

        for rule in snapshot.rules() {
            let listen = match self.listen_address {
                Some(ip) => SocketAddr::new(ip, rule.listen.port()),
                None => rule.listen,
            };

            writeln!(
                out,
                "server {{ listen {}; proxy_pass {}; {}}}\t# endpoint={}",
                listen, rule.target, extra, rule.target
            )
            .ok();
        }

        out
    }
}
