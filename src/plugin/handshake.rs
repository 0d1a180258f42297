//! Handshake between the proxy and a freshly spawned plugin process
//!
//! The host passes a magic cookie and its protocol version through the
//! environment. A conforming plugin answers with a single line on stdout:
//!
//! ```text
//! CORE|APP|TRANSPORT|PROTOCOL      e.g. 1|1|stdio|jsonrpc
//! ```
//!
//! Nothing else is sent in either direction until that line has been
//! verified, so an arbitrary executable dropped into the plugin directory is
//! rejected before it ever sees a message body.

/// Version of the framing layer itself, independent of the filter protocol
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the protocol version(s) the host speaks
pub const PROTOCOL_VERSIONS_ENV: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// The only transport currently offered: JSON frames over the child's stdio
pub const TRANSPORT_STDIO: &str = "stdio";

/// Frame encoding spoken after the handshake
pub const RPC_PROTOCOL: &str = "jsonrpc";

/// Handshake parameters shared by the host and every plugin binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Application protocol version of the filter service
    pub protocol_version: u32,
    /// Environment variable name of the magic cookie
    pub magic_cookie_key: &'static str,
    /// Expected value of the magic cookie
    pub magic_cookie_value: &'static str,
}

/// Handshake used by the Kafka proxy and all of its filter plugins
pub const HANDSHAKE: HandshakeConfig = HandshakeConfig {
    protocol_version: 1,
    magic_cookie_key: "KAFKA_PROXY_FILTER_PLUGIN",
    magic_cookie_value: "kafka-proxy-filter",
};

impl HandshakeConfig {
    /// Environment the host sets on every plugin it launches
    pub fn plugin_env(&self) -> [(&'static str, String); 2] {
        [
            (self.magic_cookie_key, self.magic_cookie_value.to_string()),
            (PROTOCOL_VERSIONS_ENV, self.protocol_version.to_string()),
        ]
    }

    /// Whether the cookie found in a plugin's environment is the expected one
    pub fn cookie_matches(&self, value: Option<&str>) -> bool {
        value == Some(self.magic_cookie_value)
    }

    /// Line a plugin writes to stdout once it has accepted the cookie
    pub fn handshake_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            CORE_PROTOCOL_VERSION, self.protocol_version, TRANSPORT_STDIO, RPC_PROTOCOL
        )
    }

    /// Check a handshake line received from a plugin.
    ///
    /// Returns a human readable reason on mismatch.
    pub fn verify_line(&self, line: &str) -> Result<(), String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 4 {
            return Err(format!(
                "malformed handshake line {line:?}: expected 4 '|'-separated fields, got {}",
                parts.len()
            ));
        }

        let core: u32 = parts[0]
            .parse()
            .map_err(|_| format!("invalid core protocol version {:?}", parts[0]))?;
        if core != CORE_PROTOCOL_VERSION {
            return Err(format!(
                "incompatible core protocol version: plugin speaks {}, host speaks {}",
                core, CORE_PROTOCOL_VERSION
            ));
        }

        let app: u32 = parts[1]
            .parse()
            .map_err(|_| format!("invalid plugin protocol version {:?}", parts[1]))?;
        if app != self.protocol_version {
            return Err(format!(
                "incompatible plugin protocol version: plugin speaks {app}, host speaks {}",
                self.protocol_version
            ));
        }

        if parts[2] != TRANSPORT_STDIO {
            return Err(format!("unsupported transport {:?}", parts[2]));
        }

        if parts[3] != RPC_PROTOCOL {
            return Err(format!("unsupported RPC protocol {:?}", parts[3]));
        }

        Ok(())
    }
}
