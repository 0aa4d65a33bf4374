use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::{Duration, interval};
use tracing::{info, warn};

// Single proxy endpoint

pub struct Endpoint {
    pub url: String,
    healthy: AtomicBool,
}

impl Endpoint {
    pub fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BalancePolicy {
    RoundRobin,
    Random,
}

// Load balancer over the proxy endpoints

pub struct LoadBalancer {
    endpoints: Vec<Arc<Endpoint>>,
    policy: BalancePolicy,
    current: AtomicUsize,
}

impl LoadBalancer {
    // Accepts "host:port" or full urls; blanks are skipped
    pub fn new<I, S>(urls: I, policy: BalancePolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints: Vec<Arc<Endpoint>> = urls
            .into_iter()
            .filter_map(|s| {
                let url = s.as_ref().trim().trim_end_matches('/');
                if url.is_empty() {
                    return None;
                }
                // add http:// if not present
                let full_url = if url.starts_with("http") {
                    url.to_string()
                } else {
                    format!("http://{}", url)
                };
                Some(Arc::new(Endpoint::new(full_url)))
            })
            .collect();

        if !endpoints.is_empty() {
            info!(count = endpoints.len(), ?policy, "proxy load balancer initialized");
            for (i, e) in endpoints.iter().enumerate() {
                info!("  [{}] {}", i + 1, e.url);
            }
        }

        Self {
            endpoints,
            policy,
            current: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    // skips unhealthy endpoints, falls back to the policy's pick if all are
    pub fn get_endpoint(&self) -> Option<Arc<Endpoint>> {
        let len = self.endpoints.len();
        if len == 0 {
            return None;
        }
        let start = match self.policy {
            BalancePolicy::RoundRobin => self.current.fetch_add(1, Ordering::Relaxed) % len,
            BalancePolicy::Random => rand::rng().random_range(0..len),
        };

        for i in 0..len {
            let idx = (start + i) % len;
            let endpoint = &self.endpoints[idx];
            if endpoint.is_healthy() {
                return Some(Arc::clone(endpoint));
            }
        }
        Some(Arc::clone(&self.endpoints[start]))
    }

    pub fn all_endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }
}

// Health check loop - restores endpoints after transient failures

pub async fn health_checker(
    load_balancer: Arc<LoadBalancer>,
    client: reqwest::Client,
    api_key: Option<String>,
    check_interval: Duration,
) {
    let mut interval = interval(check_interval);

    info!(?check_interval, "proxy health checker started");

    loop {
        interval.tick().await;

        for endpoint in load_balancer.all_endpoints() {
            let url = format!("{}/v1/models", endpoint.url);
            let was_healthy = endpoint.is_healthy();

            let mut request = client.get(&url).timeout(Duration::from_secs(5));
            if let Some(key) = &api_key {
                request = request.bearer_auth(key);
            }
            let is_healthy = match request.send().await {
                Ok(res) => res.status().is_success(),
                Err(_) => false,
            };
            endpoint.set_healthy(is_healthy);

            // Log status changes
            if was_healthy != is_healthy {
                if is_healthy {
                    info!(endpoint = %endpoint.url, "proxy endpoint is healthy again");
                } else {
                    warn!(endpoint = %endpoint.url, "proxy endpoint is unhealthy");
                }
            }
        }
    }
}
