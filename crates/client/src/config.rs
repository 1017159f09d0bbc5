//! Client configuration from the environment
//!
//! - `LIBUSB_PROXY_HOST`: `;`-separated address list in the usual grammar;
//! - `LIBUSB_PROXY_PORT`: legacy, used only when the host field lacks a
//!   port;
//! - `LIBUSB_PROXY_DEBUG`: integer 0..4 selecting log verbosity
//!   (err/warn/info/dbg).

use common::{debug_level_filter, parse_addr_list, AddrError, ProxyAddr, DEFAULT_ADDRESS,
    DEFAULT_PORT};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server addresses, tried in order.
    pub addresses: Vec<ProxyAddr>,
    /// Verbosity from `LIBUSB_PROXY_DEBUG`, 0..4.
    pub debug_level: u8,
}

impl ClientConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, AddrError> {
        Self::from_parts(
            std::env::var("LIBUSB_PROXY_HOST").ok(),
            std::env::var("LIBUSB_PROXY_PORT").ok(),
            std::env::var("LIBUSB_PROXY_DEBUG").ok(),
        )
    }

    /// Build the configuration from raw variable values. Split out of
    /// [`ClientConfig::from_env`] so tests do not mutate process globals.
    pub fn from_parts(
        host: Option<String>,
        port: Option<String>,
        debug: Option<String>,
    ) -> Result<Self, AddrError> {
        let fallback_port = port
            .as_deref()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let host = host.unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        let addresses = parse_addr_list(&host, fallback_port)?;

        let debug_level = debug
            .as_deref()
            .and_then(|d| d.trim().parse::<u8>().ok())
            .unwrap_or(0)
            .min(4);

        Ok(Self {
            addresses,
            debug_level,
        })
    }

    /// Log filter directive for the configured debug level.
    pub fn log_filter(&self) -> &'static str {
        debug_level_filter(self.debug_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_parts(None, None, None).unwrap();
        assert_eq!(
            config.addresses,
            vec![ProxyAddr::Tcp {
                host: "localhost".to_string(),
                port: DEFAULT_PORT,
            }]
        );
        assert_eq!(config.debug_level, 0);
        assert_eq!(config.log_filter(), "error");
    }

    #[test]
    fn test_host_list() {
        let config = ClientConfig::from_parts(
            Some("tcp://a:1;local:///tmp/usb.sock".to_string()),
            None,
            None,
        )
        .unwrap();
        assert_eq!(config.addresses.len(), 2);
    }

    #[test]
    fn test_legacy_port_fills_missing_port() {
        let config = ClientConfig::from_parts(
            Some("usbhost".to_string()),
            Some("9000".to_string()),
            None,
        )
        .unwrap();
        assert_eq!(
            config.addresses,
            vec![ProxyAddr::Tcp {
                host: "usbhost".to_string(),
                port: 9000,
            }]
        );
    }

    #[test]
    fn test_legacy_port_ignored_when_host_has_port() {
        let config = ClientConfig::from_parts(
            Some("usbhost:1234".to_string()),
            Some("9000".to_string()),
            None,
        )
        .unwrap();
        assert_eq!(
            config.addresses,
            vec![ProxyAddr::Tcp {
                host: "usbhost".to_string(),
                port: 1234,
            }]
        );
    }

    #[test]
    fn test_debug_level_clamped() {
        let config =
            ClientConfig::from_parts(None, None, Some("3".to_string())).unwrap();
        assert_eq!(config.debug_level, 3);
        assert_eq!(config.log_filter(), "debug");

        let config =
            ClientConfig::from_parts(None, None, Some("17".to_string())).unwrap();
        assert_eq!(config.debug_level, 4);

        let config =
            ClientConfig::from_parts(None, None, Some("junk".to_string())).unwrap();
        assert_eq!(config.debug_level, 0);
    }
}
