use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::BackendMode;
use crate::cache::CacheConfig;
use crate::dispatcher::DispatchConfig;
use crate::load_balancer::BalancePolicy;
use crate::scanner::ScannerConfig;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "imagegen-gateway")]
#[command(about = "Speculative image generation for streamed chat text")]
pub struct Args {
    /// Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Primary backend mode
    #[arg(long, value_enum, default_value_t = BackendMode::DirectKey)]
    pub mode: BackendMode,

    /// API keys for direct-key mode, comma-separated, used round-robin
    #[arg(long, value_delimiter = ',')]
    pub api_keys: Vec<String>,

    #[arg(long, default_value = "https://generativelanguage.googleapis.com/v1beta")]
    pub direct_endpoint: String,

    #[arg(long, default_value = "gemini-2.5-flash-image")]
    pub direct_model: String,

    /// Proxy endpoints (comma-separated)
    /// Example: "localhost:3000,proxy.internal:3000"
    #[arg(long, value_delimiter = ',')]
    pub proxy_urls: Vec<String>,

    /// Bearer credential shared by all proxy endpoints
    #[arg(long)]
    pub proxy_api_key: Option<String>,

    #[arg(long, default_value = "gemini-2.5-flash-image")]
    pub proxy_model: String,

    #[arg(long, value_enum, default_value_t = BalancePolicy::RoundRobin)]
    pub lb_policy: BalancePolicy,

    /// Route everything to the local workflow server, whatever the mode
    #[arg(long)]
    pub local_workflow: bool,

    #[arg(long, default_value = "http://127.0.0.1:8188")]
    pub comfy_url: String,

    /// Workflow JSON with %prompt% and %seed% placeholders
    #[arg(long)]
    pub workflow_file: Option<PathBuf>,

    /// Cache TTL in days, 0 disables the cache
    #[arg(short, long, default_value_t = 7)]
    pub cache_ttl_days: u64,

    /// JSON file backing the cache; memory only when unset
    #[arg(long)]
    pub cache_path: Option<PathBuf>,

    #[arg(long, default_value_t = 256)]
    pub cache_max_entries: usize,

    /// Backlog parallelism; defaults to the proxy endpoint count in proxy mode, else 1
    #[arg(long)]
    pub concurrency: Option<usize>,

    #[arg(long, default_value = "image:{")]
    pub marker_open: String,

    #[arg(long, default_value = "}")]
    pub marker_close: String,

    /// Disable prompt extraction from streamed JSON payloads
    #[arg(long)]
    pub no_heuristic: bool,

    #[arg(long, default_value = "prompt")]
    pub heuristic_field: String,

    #[arg(long, default_value_t = 40)]
    pub heuristic_min_chars: usize,

    #[arg(long, default_value_t = 1000)]
    pub heuristic_max_chars: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 120)]
    pub request_timeout: u64,

    #[arg(long, default_value_t = 1000)]
    pub poll_interval_ms: u64,

    #[arg(long, default_value_t = 600)]
    pub poll_max_attempts: u32,

    /// Directory holding named reference images
    #[arg(long)]
    pub reference_dir: Option<PathBuf>,

    /// Queue spans instead of generating while the text streams
    #[arg(long)]
    pub no_speculative: bool,

    /// Proxy health check interval in seconds, 0 disables
    #[arg(long, default_value_t = 30)]
    pub health_interval: u64,

    /// Per-stream text buffer ceiling in bytes
    #[arg(long, default_value_t = 256 * 1024)]
    pub buffer_ceiling: usize,

    /// Forget streams idle for this many seconds, 0 keeps them
    #[arg(long, default_value_t = 600)]
    pub stream_idle_secs: u64,
}

/// Everything a backend needs; fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub mode: BackendMode,
    pub api_keys: Vec<String>,
    pub direct_endpoint: String,
    pub direct_model: String,
    pub proxy_urls: Vec<String>,
    pub proxy_api_key: Option<String>,
    pub proxy_model: String,
    pub balance_policy: BalancePolicy,
    pub local_workflow: bool,
    pub comfy_url: String,
    pub workflow_file: Option<PathBuf>,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::DirectKey,
            api_keys: Vec::new(),
            direct_endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            direct_model: "gemini-2.5-flash-image".to_string(),
            proxy_urls: Vec::new(),
            proxy_api_key: None,
            proxy_model: "gemini-2.5-flash-image".to_string(),
            balance_policy: BalancePolicy::RoundRobin,
            local_workflow: false,
            comfy_url: "http://127.0.0.1:8188".to_string(),
            workflow_file: None,
            request_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            poll_max_attempts: 600,
        }
    }
}

impl BackendConfig {
    // one slot per proxy endpoint, otherwise strictly sequential
    pub fn default_concurrency(&self) -> usize {
        if self.local_workflow || self.mode != BackendMode::LoadBalancedProxy {
            return 1;
        }
        self.proxy_urls
            .iter()
            .filter(|url| !url.trim().is_empty())
            .count()
            .max(1)
    }
}

impl Args {
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            mode: self.mode,
            api_keys: self.api_keys.clone(),
            direct_endpoint: self.direct_endpoint.clone(),
            direct_model: self.direct_model.clone(),
            proxy_urls: self.proxy_urls.clone(),
            proxy_api_key: self.proxy_api_key.clone(),
            proxy_model: self.proxy_model.clone(),
            balance_policy: self.lb_policy,
            local_workflow: self.local_workflow,
            comfy_url: self.comfy_url.clone(),
            workflow_file: self.workflow_file.clone(),
            request_timeout: Duration::from_secs(self.request_timeout.max(1)),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_max_attempts: self.poll_max_attempts,
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            open_token: self.marker_open.clone(),
            close_token: self.marker_close.clone(),
            heuristic_enabled: !self.no_heuristic,
            heuristic_field: self.heuristic_field.clone(),
            heuristic_min_chars: self.heuristic_min_chars,
            heuristic_max_chars: self.heuristic_max_chars.max(self.heuristic_min_chars),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl_days: self.cache_ttl_days,
            path: self.cache_path.clone(),
            max_entries: self.cache_max_entries,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            speculative: !self.no_speculative,
            buffer_ceiling: self.buffer_ceiling,
            stream_idle: Duration::from_secs(self.stream_idle_secs),
            ..DispatchConfig::default()
        }
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency
            .filter(|n| *n > 0)
            .unwrap_or_else(|| self.backend_config().default_concurrency())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["imagegen-gateway"]);
        assert_eq!(args.mode, BackendMode::DirectKey);
        assert_eq!(args.cache_ttl_days, 7);
        assert_eq!(args.concurrency_limit(), 1);
        assert!(args.dispatch_config().speculative);
        assert_eq!(args.dispatch_config().stream_idle, Duration::from_secs(600));
        assert!(args.scanner_config().heuristic_enabled);
    }

    #[test]
    fn proxy_mode_concurrency_follows_endpoint_count() {
        let args = Args::parse_from([
            "imagegen-gateway",
            "--mode",
            "load-balanced-proxy",
            "--proxy-urls",
            "http://a,http://b,http://c",
            "--lb-policy",
            "random",
        ]);
        assert_eq!(args.proxy_urls.len(), 3);
        assert_eq!(args.lb_policy, BalancePolicy::Random);
        assert_eq!(args.concurrency_limit(), 3);
    }

    #[test]
    fn explicit_concurrency_wins() {
        let args = Args::parse_from([
            "imagegen-gateway",
            "--mode",
            "load-balanced-proxy",
            "--proxy-urls",
            "http://a,http://b",
            "--concurrency",
            "5",
        ]);
        assert_eq!(args.concurrency_limit(), 5);
    }

    #[test]
    fn local_workflow_runs_one_at_a_time() {
        let args = Args::parse_from([
            "imagegen-gateway",
            "--mode",
            "load-balanced-proxy",
            "--proxy-urls",
            "http://a,http://b",
            "--local-workflow",
        ]);
        assert_eq!(args.concurrency_limit(), 1);
    }

    #[test]
    fn marker_and_heuristic_settings_flow_into_scanner() {
        let args = Args::parse_from([
            "imagegen-gateway",
            "--marker-open",
            "<img>",
            "--marker-close",
            "</img>",
            "--heuristic-min-chars",
            "50",
            "--heuristic-max-chars",
            "20",
            "--no-heuristic",
        ]);
        let scanner = args.scanner_config();
        assert_eq!(scanner.open_token, "<img>");
        assert_eq!(scanner.close_token, "</img>");
        assert!(!scanner.heuristic_enabled);
        assert_eq!(scanner.heuristic_max_chars, 50);
    }
}
