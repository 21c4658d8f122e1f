//! Provider registry and failover.
//!
//! Catalogs the configured TTS/STT endpoints, probes their health lazily
//! (cached for a TTL), selects deterministically given hints and policy, and
//! rotates to the next candidate on transient failures. Health mutations go
//! through the registry's write lock only; selections read a snapshot.

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, VoiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Tts,
    Stt,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tts => "tts",
            Self::Stt => "stt",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointHealth {
    Healthy,
    /// Some recent transient failures, still below the unhealthy threshold.
    Degraded,
    Unhealthy,
    Unknown,
}

/// One configured speech endpoint.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub id: String,
    pub base_url: String,
    pub kind: ProviderKind,
    /// Loopback-hosted endpoints sort first under `prefer_local` and may be
    /// trusted unprobed under `always_try_local`.
    pub local: bool,
    /// Supported voices, when known. `None` means undiscovered: any voice
    /// passes the capability filter.
    pub voices: Option<HashSet<String>>,
    pub models: Option<HashSet<String>>,
}

impl ProviderEndpoint {
    pub fn new(kind: ProviderKind, base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            id: derive_id(kind, &base_url),
            local: is_local_url(&base_url),
            base_url,
            kind,
            voices: None,
            models: None,
        }
    }

    fn supports(&self, voice: Option<&str>, model: Option<&str>) -> bool {
        let voice_ok = match (&self.voices, voice) {
            (Some(set), Some(v)) => set.contains(v),
            _ => true,
        };
        let model_ok = match (&self.models, model) {
            (Some(set), Some(m)) => set.contains(m),
            _ => true,
        };
        voice_ok && model_ok
    }
}

/// Endpoint id derived from its URL: `tts:localhost:8880`.
fn derive_id(kind: ProviderKind, base_url: &str) -> String {
    let hostport = base_url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .split('/')
        .next()
        .unwrap_or(base_url);
    format!("{kind}:{hostport}")
}

fn is_local_url(base_url: &str) -> bool {
    ["localhost", "127.0.0.1", "[::1]", "0.0.0.0"]
        .iter()
        .any(|h| base_url.contains(h))
}

/// Selection constraints for one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionRequest<'a> {
    /// Preferred endpoint id; considered first when it matches.
    pub hint: Option<&'a str>,
    pub voice: Option<&'a str>,
    pub model: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct RegistryPolicy {
    pub prefer_local: bool,
    pub always_try_local: bool,
    pub health_ttl: Duration,
    pub unhealthy_threshold: u32,
}

impl RegistryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefer_local: config.prefer_local,
            always_try_local: config.always_try_local,
            health_ttl: Duration::from_secs_f64(config.health_ttl_s),
            unhealthy_threshold: config.unhealthy_threshold.max(1),
        }
    }
}

struct EndpointState {
    endpoint: ProviderEndpoint,
    health: EndpointHealth,
    last_check: Option<Instant>,
    error_streak: u32,
}

/// Read-only status row for the RPC listing.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub id: String,
    pub base_url: String,
    pub kind: ProviderKind,
    pub health: EndpointHealth,
    pub error_streak: u32,
    pub local: bool,
}

pub struct ProviderRegistry {
    states: RwLock<Vec<EndpointState>>,
    policy: RegistryPolicy,
    client: reqwest::Client,
}

impl ProviderRegistry {
    pub fn new(
        endpoints: Vec<ProviderEndpoint>,
        policy: RegistryPolicy,
        client: reqwest::Client,
    ) -> Self {
        let states = endpoints
            .into_iter()
            .map(|endpoint| EndpointState {
                endpoint,
                health: EndpointHealth::Unknown,
                last_check: None,
                error_streak: 0,
            })
            .collect();
        Self {
            states: RwLock::new(states),
            policy,
            client,
        }
    }

    /// Build the registry from the configured URL lists, preserving order.
    pub fn from_config(config: &Config, client: reqwest::Client) -> Self {
        let mut endpoints = Vec::new();
        for url in &config.tts_base_urls {
            endpoints.push(ProviderEndpoint::new(ProviderKind::Tts, url));
        }
        for url in &config.stt_base_urls {
            endpoints.push(ProviderEndpoint::new(ProviderKind::Stt, url));
        }
        info!(count = endpoints.len(), "provider registry initialized");
        Self::new(endpoints, RegistryPolicy::from_config(config), client)
    }

    /// Pick the first healthy candidate for the request. Deterministic given
    /// the registry contents and cached health.
    pub async fn select(
        &self,
        kind: ProviderKind,
        req: SelectionRequest<'_>,
    ) -> Result<ProviderEndpoint> {
        self.select_excluding(kind, req, &HashSet::new()).await
    }

    async fn select_excluding(
        &self,
        kind: ProviderKind,
        req: SelectionRequest<'_>,
        exclude: &HashSet<String>,
    ) -> Result<ProviderEndpoint> {
        let candidates = self.candidate_order(kind, req, exclude);
        for endpoint in candidates {
            let health = self.effective_health(&endpoint).await;
            match health {
                EndpointHealth::Healthy | EndpointHealth::Degraded => {
                    debug!(id = %endpoint.id, ?health, "provider selected");
                    return Ok(endpoint);
                }
                EndpointHealth::Unhealthy | EndpointHealth::Unknown => {
                    debug!(id = %endpoint.id, ?health, "provider skipped");
                }
            }
        }
        Err(VoiceError::NoProvider {
            kind: kind.as_str(),
        })
    }

    /// Filter and order candidates: capability match, hint first, then
    /// locals before remotes under `prefer_local` (stable within groups,
    /// preserving configured order otherwise).
    fn candidate_order(
        &self,
        kind: ProviderKind,
        req: SelectionRequest<'_>,
        exclude: &HashSet<String>,
    ) -> Vec<ProviderEndpoint> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<ProviderEndpoint> = states
            .iter()
            .filter(|s| s.endpoint.kind == kind)
            .filter(|s| !exclude.contains(&s.endpoint.id))
            .filter(|s| s.endpoint.supports(req.voice, req.model))
            .map(|s| s.endpoint.clone())
            .collect();
        drop(states);

        if self.policy.prefer_local {
            candidates.sort_by_key(|e| !e.local);
        }
        if let Some(hint) = req.hint {
            if let Some(pos) = candidates.iter().position(|e| e.id == hint) {
                let hinted = candidates.remove(pos);
                candidates.insert(0, hinted);
            }
        }
        candidates
    }

    /// Cached health, refreshed by a probe when unknown or stale. Locals are
    /// trusted unprobed under `always_try_local`.
    async fn effective_health(&self, endpoint: &ProviderEndpoint) -> EndpointHealth {
        {
            let states = self.states.read().unwrap_or_else(|e| e.into_inner());
            if let Some(s) = states.iter().find(|s| s.endpoint.id == endpoint.id) {
                let fresh = s
                    .last_check
                    .map(|t| t.elapsed() < self.policy.health_ttl)
                    .unwrap_or(false);
                if fresh {
                    return s.health;
                }
            }
        }

        if self.policy.always_try_local && endpoint.local {
            return EndpointHealth::Healthy;
        }

        let health = self.probe(endpoint).await;
        self.update(&endpoint.id, |s| {
            s.health = health;
            s.last_check = Some(Instant::now());
            if health == EndpointHealth::Healthy {
                s.error_streak = 0;
            }
        });
        health
    }

    /// Lightweight reachability probe. Any HTTP response (even a 404 from an
    /// endpoint without a dedicated health path) proves the service is up;
    /// only transport errors mark it unhealthy. Probes never count against
    /// failover attempts.
    async fn probe(&self, endpoint: &ProviderEndpoint) -> EndpointHealth {
        let url = format!("{}/health", endpoint.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(_) => {
                debug!(id = %endpoint.id, "health probe ok");
                EndpointHealth::Healthy
            }
            Err(e) => {
                warn!(id = %endpoint.id, error = %e, "health probe failed");
                EndpointHealth::Unhealthy
            }
        }
    }

    /// Run `attempt` against candidates in selection order, rotating on
    /// transient failures until one succeeds or the candidates run out.
    /// 4xx rejections rotate without a health penalty; other error kinds
    /// (cancellation, device) abort immediately.
    pub async fn with_failover<T, F, Fut>(
        &self,
        kind: ProviderKind,
        req: SelectionRequest<'_>,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut(ProviderEndpoint) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_err: Option<VoiceError> = None;

        loop {
            let endpoint = match self.select_excluding(kind, req, &tried).await {
                Ok(ep) => ep,
                Err(select_err) => {
                    return Err(last_err.unwrap_or(select_err));
                }
            };
            tried.insert(endpoint.id.clone());

            match attempt(endpoint.clone()).await {
                Ok(value) => {
                    self.mark_success(&endpoint.id);
                    return Ok(value);
                }
                Err(e) if e.is_client() => {
                    // The endpoint is healthy but rejected the request;
                    // rotate without touching its health.
                    warn!(id = %endpoint.id, error = %e, "client error, rotating");
                    last_err = Some(e);
                }
                Err(e) if e.is_transient() => {
                    warn!(id = %endpoint.id, error = %e, "transient failure, rotating");
                    self.mark_failure(&endpoint.id);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reset the streak and mark healthy.
    pub fn mark_success(&self, id: &str) {
        self.update(id, |s| {
            s.error_streak = 0;
            s.health = EndpointHealth::Healthy;
            s.last_check = Some(Instant::now());
        });
    }

    /// Bump the streak; cross the threshold and the endpoint goes unhealthy
    /// until its next (post-TTL) probe.
    pub fn mark_failure(&self, id: &str) {
        let threshold = self.policy.unhealthy_threshold;
        self.update(id, |s| {
            s.error_streak += 1;
            s.health = if s.error_streak >= threshold {
                EndpointHealth::Unhealthy
            } else {
                EndpointHealth::Degraded
            };
            s.last_check = Some(Instant::now());
        });
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut EndpointState)) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = states.iter_mut().find(|s| s.endpoint.id == id) {
            f(s);
        }
    }

    /// Status rows for observation (RPC listing, logs).
    pub fn snapshot(&self) -> Vec<ProviderStatus> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states
            .iter()
            .map(|s| ProviderStatus {
                id: s.endpoint.id.clone(),
                base_url: s.endpoint.base_url.clone(),
                kind: s.endpoint.kind,
                health: s.health,
                error_streak: s.error_streak,
                local: s.endpoint.local,
            })
            .collect()
    }

    #[cfg(test)]
    fn force_health(&self, id: &str, health: EndpointHealth) {
        self.update(id, |s| {
            s.health = health;
            s.last_check = Some(Instant::now());
        });
    }

    #[cfg(test)]
    fn streak_of(&self, id: &str) -> u32 {
        let states = self.states.read().unwrap();
        states
            .iter()
            .find(|s| s.endpoint.id == id)
            .map(|s| s.error_streak)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn health_of(&self, id: &str) -> EndpointHealth {
        let states = self.states.read().unwrap();
        states
            .iter()
            .find(|s| s.endpoint.id == id)
            .map(|s| s.health)
            .unwrap_or(EndpointHealth::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RegistryPolicy {
        RegistryPolicy {
            prefer_local: false,
            always_try_local: false,
            health_ttl: Duration::from_secs(30),
            unhealthy_threshold: 3,
        }
    }

    /// Registry with all endpoints pre-marked healthy and fresh, so tests
    /// never hit the network probe.
    fn registry(urls: &[(&str, ProviderKind)], policy: RegistryPolicy) -> ProviderRegistry {
        let endpoints = urls
            .iter()
            .map(|(u, k)| ProviderEndpoint::new(*k, u))
            .collect();
        let reg = ProviderRegistry::new(endpoints, policy, reqwest::Client::new());
        for status in reg.snapshot() {
            reg.force_health(&status.id, EndpointHealth::Healthy);
        }
        reg
    }

    #[test]
    fn id_derivation_and_locality() {
        let ep = ProviderEndpoint::new(ProviderKind::Stt, "http://localhost:2022/v1");
        assert_eq!(ep.id, "stt:localhost:2022");
        assert!(ep.local);
        let ep = ProviderEndpoint::new(ProviderKind::Tts, "https://api.openai.com/v1");
        assert_eq!(ep.id, "tts:api.openai.com");
        assert!(!ep.local);
    }

    #[tokio::test]
    async fn selects_in_configured_order() {
        let reg = registry(
            &[
                ("http://a.example/v1", ProviderKind::Stt),
                ("http://b.example/v1", ProviderKind::Stt),
            ],
            policy(),
        );
        let ep = reg
            .select(ProviderKind::Stt, SelectionRequest::default())
            .await
            .unwrap();
        assert_eq!(ep.id, "stt:a.example");
    }

    #[tokio::test]
    async fn hint_wins_over_order() {
        let reg = registry(
            &[
                ("http://a.example/v1", ProviderKind::Stt),
                ("http://b.example/v1", ProviderKind::Stt),
            ],
            policy(),
        );
        let ep = reg
            .select(
                ProviderKind::Stt,
                SelectionRequest {
                    hint: Some("stt:b.example"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ep.id, "stt:b.example");
    }

    #[tokio::test]
    async fn prefer_local_sorts_locals_first() {
        let mut p = policy();
        p.prefer_local = true;
        let reg = registry(
            &[
                ("http://remote.example/v1", ProviderKind::Tts),
                ("http://localhost:8880/v1", ProviderKind::Tts),
            ],
            p,
        );
        let ep = reg
            .select(ProviderKind::Tts, SelectionRequest::default())
            .await
            .unwrap();
        assert_eq!(ep.id, "tts:localhost:8880");
    }

    #[tokio::test]
    async fn unhealthy_endpoints_are_never_selected() {
        let reg = registry(
            &[
                ("http://a.example/v1", ProviderKind::Stt),
                ("http://b.example/v1", ProviderKind::Stt),
            ],
            policy(),
        );
        reg.force_health("stt:a.example", EndpointHealth::Unhealthy);
        let ep = reg
            .select(ProviderKind::Stt, SelectionRequest::default())
            .await
            .unwrap();
        assert_eq!(ep.id, "stt:b.example");
    }

    #[tokio::test]
    async fn kind_filter_applies() {
        let reg = registry(&[("http://a.example/v1", ProviderKind::Tts)], policy());
        let err = reg
            .select(ProviderKind::Stt, SelectionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::NoProvider { kind: "stt" }));
    }

    #[tokio::test]
    async fn voice_capability_filters_candidates() {
        let mut ep = ProviderEndpoint::new(ProviderKind::Tts, "http://a.example/v1");
        ep.voices = Some(["alloy".to_string()].into_iter().collect());
        let other = ProviderEndpoint::new(ProviderKind::Tts, "http://b.example/v1");
        let reg = ProviderRegistry::new(vec![ep, other], policy(), reqwest::Client::new());
        for status in reg.snapshot() {
            reg.force_health(&status.id, EndpointHealth::Healthy);
        }

        let selected = reg
            .select(
                ProviderKind::Tts,
                SelectionRequest {
                    voice: Some("af_sky"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // a.example only knows "alloy"; b.example is undiscovered and passes.
        assert_eq!(selected.id, "tts:b.example");
    }

    #[tokio::test]
    async fn failover_rotates_on_transient_and_marks_health() {
        let reg = registry(
            &[
                ("http://localhost:2022/v1", ProviderKind::Stt),
                ("http://api.example/v1", ProviderKind::Stt),
            ],
            policy(),
        );

        let calls = AtomicU32::new(0);
        let text = reg
            .with_failover(ProviderKind::Stt, SelectionRequest::default(), |ep| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if ep.local {
                        Err(VoiceError::from_status(500, "boom".into()))
                    } else {
                        Ok("hello".to_string())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(text, "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(reg.streak_of("stt:localhost:2022"), 1);
        assert_eq!(reg.health_of("stt:localhost:2022"), EndpointHealth::Degraded);
        assert_eq!(reg.streak_of("stt:api.example"), 0);
        assert_eq!(reg.health_of("stt:api.example"), EndpointHealth::Healthy);
    }

    #[tokio::test]
    async fn failover_exhausts_candidates_and_returns_last_error() {
        let reg = registry(
            &[
                ("http://a.example/v1", ProviderKind::Tts),
                ("http://b.example/v1", ProviderKind::Tts),
            ],
            policy(),
        );
        let calls = AtomicU32::new(0);
        let err = reg
            .with_failover(ProviderKind::Tts, SelectionRequest::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(VoiceError::transient("down")) }
            })
            .await
            .unwrap_err();
        // One attempt per candidate, never more.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_errors_rotate_without_health_penalty() {
        let reg = registry(
            &[
                ("http://a.example/v1", ProviderKind::Tts),
                ("http://b.example/v1", ProviderKind::Tts),
            ],
            policy(),
        );
        let result = reg
            .with_failover(ProviderKind::Tts, SelectionRequest::default(), |ep| async move {
                if ep.id == "tts:a.example" {
                    Err(VoiceError::from_status(400, "bad voice".into()))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(reg.streak_of("tts:a.example"), 0);
        assert_eq!(reg.health_of("tts:a.example"), EndpointHealth::Healthy);
    }

    #[tokio::test]
    async fn cancellation_aborts_failover() {
        let reg = registry(
            &[
                ("http://a.example/v1", ProviderKind::Tts),
                ("http://b.example/v1", ProviderKind::Tts),
            ],
            policy(),
        );
        let calls = AtomicU32::new(0);
        let err = reg
            .with_failover(ProviderKind::Tts, SelectionRequest::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(VoiceError::cancelled("user")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, VoiceError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn threshold_crossing_marks_unhealthy() {
        let reg = registry(&[("http://a.example/v1", ProviderKind::Stt)], policy());
        for _ in 0..3 {
            reg.mark_failure("stt:a.example");
        }
        assert_eq!(reg.health_of("stt:a.example"), EndpointHealth::Unhealthy);
        let err = reg
            .select(ProviderKind::Stt, SelectionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::NoProvider { .. }));
        // Success heals immediately.
        reg.mark_success("stt:a.example");
        assert!(reg
            .select(ProviderKind::Stt, SelectionRequest::default())
            .await
            .is_ok());
    }
}
