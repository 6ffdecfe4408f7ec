#![forbid(unsafe_code)]

pub mod env;
pub mod http;
pub mod lifecycle;
pub mod telemetry;

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `host:port` address.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct HostPort {
		pub host: String,
		pub port: u16,
	}

	impl HostPort {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// `http://host:port` base URL for outbound requests.
		pub fn http_base(&self) -> String {
			format!("http://{}", self.hostport())
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse an address string in the form `host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("address must be non-empty (expected host:port)".to_string());
			}

			if s.contains("://") || s.contains('/') || s.contains('?') || s.contains('#') {
				return Err(format!("invalid address (expected host:port without scheme or path): {s}"));
			}

			let (host, port_str) = s
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid address (missing :port, expected host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid address host (expected host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("invalid address host (IPv6 must be bracketed like [::1]:8080): {s}"));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid address port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid address port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	impl std::fmt::Display for HostPort {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.write_str(&self.hostport())
		}
	}

}
