//! LAN coordinator discovery: seed URLs from hints and local addresses,
//! then a bounded-concurrency /24 sweep probing `GET /` for the coordinator
//! service signature.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::net::{discovery_hosts, local_ipv4_addresses, rank_ipv4};

const PROBE_TIMEOUT: Duration = Duration::from_millis(180);
const MAX_PROBE_WORKERS: usize = 48;
const MAX_RESULTS: usize = 8;
const CACHE_TTL: Duration = Duration::from_secs(6);

fn rank_url_host(url: &str) -> (u8, String) {
    let host = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url)
        .split([':', '/'])
        .next()
        .unwrap_or("")
        .to_string();
    match host.parse() {
        Ok(addr) => (rank_ipv4(addr), host),
        Err(_) if host == "localhost" => (5, host),
        Err(_) => (8, host),
    }
}

/// Normalize a hint into `http(s)://host:port` or drop it.
fn normalize_base_url(raw: &str, default_port: u16) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let (scheme, rest) = with_scheme.split_once("://")?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_raw)) => (host, port_raw.parse().ok()?),
        None => (rest, default_port),
    };
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some(format!("{scheme}://{host}:{port}"))
}

/// Candidate coordinator URLs from env hints, localhost, and every local
/// IPv4, ordered by host rank.
pub fn seed_urls(port: u16) -> Vec<String> {
    let mut raw_values: Vec<String> = vec![
        std::env::var("BEACON_DEFAULT_COORDINATOR_URL").unwrap_or_default(),
        std::env::var("BEACON_LOCAL_COORDINATOR_URL").unwrap_or_default(),
        std::env::var("AGENT_COORDINATOR_URL").unwrap_or_default(),
    ];
    if let Ok(hints) = std::env::var("BEACON_COORDINATOR_HINTS") {
        raw_values.extend(hints.split(',').map(str::to_string));
    }
    raw_values.push(format!("http://127.0.0.1:{port}"));
    raw_values.push(format!("http://localhost:{port}"));
    for addr in local_ipv4_addresses(false) {
        raw_values.push(format!("http://{addr}:{port}"));
    }

    let mut urls: Vec<String> = raw_values
        .iter()
        .filter_map(|value| normalize_base_url(value, port))
        .collect();
    urls.sort_by_key(|url| rank_url_host(url));
    urls.dedup();
    urls
}

async fn probe_coordinator(client: reqwest::Client, url: String, timeout: Duration) -> Option<String> {
    let response = client
        .get(format!("{}/", url.trim_end_matches('/')))
        .timeout(timeout)
        .header("accept", "application/json")
        .send()
        .await
        .ok()?;
    let payload: Value = response.json().await.ok()?;
    let service = payload.get("service").and_then(Value::as_str)?;
    if service.trim().eq_ignore_ascii_case("coordinator") {
        Some(url.trim_end_matches('/').to_string())
    } else {
        None
    }
}

async fn probe_many(
    client: &reqwest::Client,
    urls: Vec<String>,
    timeout: Duration,
    max_results: usize,
    seen: &mut Vec<String>,
) -> Vec<String> {
    if urls.is_empty() || max_results == 0 {
        return vec![];
    }
    let limiter = Arc::new(Semaphore::new(MAX_PROBE_WORKERS));
    let mut join_set = JoinSet::new();
    for url in urls {
        let client = client.clone();
        let limiter = limiter.clone();
        join_set.spawn(async move {
            let _permit = limiter.acquire_owned().await;
            probe_coordinator(client, url, timeout).await
        });
    }

    let mut discovered = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        let Ok(Some(url)) = joined else { continue };
        if seen.contains(&url) {
            continue;
        }
        seen.push(url.clone());
        discovered.push(url);
        if discovered.len() >= max_results {
            join_set.abort_all();
            break;
        }
    }
    discovered
}

fn cache() -> &'static Mutex<HashMap<u16, (Instant, Vec<String>)>> {
    static CACHE: OnceLock<Mutex<HashMap<u16, (Instant, Vec<String>)>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Find coordinators on the LAN: fast direct probes of seeded URLs first,
/// then the /24 sweep for whatever is still missing. Results are cached for
/// a few seconds so repeated lookups don't rescan.
pub async fn discover_coordinators(port: u16) -> Vec<String> {
    {
        let cached = cache().lock().expect("discovery cache poisoned");
        if let Some((at, urls)) = cached.get(&port) {
            if at.elapsed() < CACHE_TTL {
                return urls.clone();
            }
        }
    }

    let client = reqwest::Client::builder()
        .build()
        .expect("reqwest client builds");
    let mut seen: Vec<String> = Vec::new();
    let mut discovered = Vec::new();

    let seeds = seed_urls(port);
    let direct_timeout = PROBE_TIMEOUT.mul_f32(1.1).min(Duration::from_millis(350));
    discovered.extend(probe_many(&client, seeds.clone(), direct_timeout, MAX_RESULTS, &mut seen).await);

    if discovered.len() < MAX_RESULTS {
        let seed_hosts: Vec<String> = seeds
            .iter()
            .chain(discovered.iter())
            .map(|url| rank_url_host(url).1)
            .collect();
        let sweep_urls: Vec<String> = discovery_hosts(254)
            .into_iter()
            .filter(|host| !seed_hosts.contains(&host.to_string()))
            .map(|host| format!("http://{host}:{port}"))
            .collect();
        debug!("sweeping {} candidate hosts for coordinators", sweep_urls.len());
        let remaining = MAX_RESULTS - discovered.len();
        discovered.extend(probe_many(&client, sweep_urls, PROBE_TIMEOUT, remaining, &mut seen).await);
    }

    discovered.sort_by_key(|url| rank_url_host(url));
    discovered.dedup();
    discovered.truncate(MAX_RESULTS);

    let mut cached = cache().lock().expect("discovery cache poisoned");
    cached.insert(port, (Instant::now(), discovered.clone()));
    discovered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_handles_bare_hosts_and_ports() {
        assert_eq!(
            normalize_base_url("192.168.1.4", 7000).as_deref(),
            Some("http://192.168.1.4:7000")
        );
        assert_eq!(
            normalize_base_url("http://192.168.1.4:9000/", 7000).as_deref(),
            Some("http://192.168.1.4:9000")
        );
        assert_eq!(
            normalize_base_url("https://box.local", 7000).as_deref(),
            Some("https://box.local:7000")
        );
        assert!(normalize_base_url("", 7000).is_none());
        assert!(normalize_base_url("http://:7000", 7000).is_none());
    }

    #[test]
    fn seeds_include_localhost_and_are_unique() {
        let urls = seed_urls(7000);
        assert!(urls.iter().any(|url| url.contains("127.0.0.1:7000")));
        let mut deduped = urls.clone();
        deduped.dedup();
        assert_eq!(urls.len(), deduped.len());
    }

    #[test]
    fn url_host_ranking_orders_lan_first() {
        let mut urls = vec![
            "http://127.0.0.1:7000".to_string(),
            "http://192.168.1.4:7000".to_string(),
            "http://10.0.0.4:7000".to_string(),
        ];
        urls.sort_by_key(|url| rank_url_host(url));
        assert_eq!(urls[0], "http://192.168.1.4:7000");
        assert_eq!(urls[2], "http://127.0.0.1:7000");
    }
}
