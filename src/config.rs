use serde::{Deserialize, Serialize};

// ------------------------------------------------------------
// Tunnel configuration
// ------------------------------------------------------------
//
// Immutable after construction. Built by the CLI (flags plus LR_*
// environment overrides) or directly by an embedding program.
//
// Notes:
// - `port` is the only required field.
// - The broker URL defaults to the public endpoint.
// - TLS options only matter when the origin is HTTPS.
//

/// Default public broker endpoint.
pub const DEFAULT_BROKER_URL: &str = "https://localrun.stream";

/// Default per-request timeout against the origin, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// Default retry budget (retries, not total attempts).
pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Port of the local origin server. Required, must be nonzero.
    pub port: u16,

    /// Host of the local origin server.
    pub local_host: String,

    /// Base URL of the tunnel broker.
    pub broker_url: String,

    /// Requested subdomain. Must be exactly 10 alphanumeric chars.
    pub subdomain: Option<String>,

    /// TLS options for dialing the origin.
    pub tls: TlsOptions,

    /// Per-request timeout against the origin, in milliseconds.
    /// The forwarder scales this adaptively per request.
    pub timeout_ms: u64,

    /// How many times a failed request is retried (transport errors
    /// and timeouts only).
    pub max_retries: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Dial the origin over HTTPS.
    pub use_tls: bool,

    /// Client certificate path (PEM).
    pub cert_path: Option<String>,

    /// Client key path (PEM).
    pub key_path: Option<String>,

    /// Extra root CA path (PEM).
    pub ca_path: Option<String>,

    /// Skip certificate verification entirely.
    pub allow_invalid_cert: bool,
}

impl TunnelConfig {
    /// A config with defaults for everything except the origin port.
    pub fn new(port: u16) -> Self {
        TunnelConfig {
            port,
            local_host: "localhost".to_string(),
            broker_url: DEFAULT_BROKER_URL.to_string(),
            subdomain: None,
            tls: TlsOptions::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// `host:port` of the origin, used in logs and error headers.
    pub fn origin_authority(&self) -> String {
        format!("{}:{}", self.local_host, self.port)
    }

    /// Base URL of the origin, scheme per the TLS options.
    pub fn origin_base_url(&self) -> String {
        let scheme = if self.tls.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.local_host, self.port)
    }

    /// Validates the config before a session is opened.
    ///
    /// Checks:
    /// - nonzero port
    /// - subdomain shape (exactly 10 alphanumeric characters)
    /// - when HTTPS without `allow_invalid_cert`: cert and key files
    ///   exist and are readable
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("origin port must be a positive integer");
        }

        if let Some(sub) = &self.subdomain {
            if !valid_subdomain(sub) {
                anyhow::bail!(
                    "invalid subdomain '{}': must be exactly 10 alphanumeric characters",
                    sub
                );
            }
        }

        if self.tls.use_tls && !self.tls.allow_invalid_cert {
            let cert = self.tls.cert_path.as_deref().ok_or_else(|| {
                anyhow::anyhow!("--local-https requires --local-cert (or --allow-invalid-cert)")
            })?;
            let key = self.tls.key_path.as_deref().ok_or_else(|| {
                anyhow::anyhow!("--local-https requires --local-key (or --allow-invalid-cert)")
            })?;
            for path in [cert, key] {
                std::fs::metadata(path)
                    .map_err(|e| anyhow::anyhow!("cannot read TLS file '{}': {}", path, e))?;
            }
        }

        Ok(())
    }
}

/// A subdomain is accepted iff it is exactly 10 ASCII alphanumerics.
///
/// The broker may well accept more, but the client-side rule is fixed
/// so a typo fails fast instead of registering something unexpected.
pub fn valid_subdomain(s: &str) -> bool {
    s.len() == 10 && s.chars().all(|c| c.is_ascii_alphanumeric())
}
