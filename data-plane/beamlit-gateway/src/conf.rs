use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Traffic listener; the operator points stolen cluster-IPs here.
    #[envconfig(from = "BEAMLIT_GW_HTTP_PORT", default = "8000")]
    pub http_port: u16,

    /// Admin listener carrying the route REST API and /healthz.
    #[envconfig(from = "BEAMLIT_GW_ADMIN_PORT", default = "8080")]
    pub admin_port: u16,

    #[envconfig(from = "BEAMLIT_GW_REQUEST_TIMEOUT_MS", default = "30000")]
    pub request_timeout_ms: u64,

    /// Maximum buffered payload size in bytes (default: 50MB).
    #[envconfig(from = "BEAMLIT_GW_MAX_PAYLOAD_BYTES", default = "52428800")]
    pub max_payload_bytes: usize,

    // Optional: either "json" or "plain"/"text"; defaults handled in
    // tracing setup
    #[envconfig(from = "BEAMLIT_GW_LOG_FORMAT")]
    pub log_format: Option<String>,
}
