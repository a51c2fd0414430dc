//! Alias routing: hostname → app.
//!
//! The resolver keeps the full alias table in memory under a `RwLock`,
//! loaded from storage at boot and kept in sync by the mutating operations
//! (which all pass through the write queue before touching the map). The
//! hot path — `resolve` on every request — is a read lock and a map lookup.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use fazt_storage::StorageBackend;

use crate::error::AliasError;
use crate::queue::WriteQueue;

/// Storage prefix for alias records.
const ALIAS_PREFIX: &str = "alias/";

/// Subdomains that short-circuit before the alias table.
pub const RESERVED_SUBDOMAINS: &[&str] = &["admin", "api"];

/// Wildcard DNS services that embed the bound IP in the domain.
const WILDCARD_DNS_SUFFIXES: &[&str] = &[".nip.io", ".sslip.io", ".traefik.me"];

/// One weighted branch of a split alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitTarget {
    pub app_id: String,
    pub weight: f64,
}

/// What an alias points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AliasTarget {
    /// Serve the app directly.
    Proxy { app_id: String },
    /// 302 to an external URL.
    Redirect { url: String },
    /// Held back; answers 403 or a system page. No targets.
    Reserved { label: String },
    /// Weighted random choice between apps. Weights may sum to anything
    /// positive; they are normalized at read time.
    Split { targets: Vec<SplitTarget> },
}

/// A stored alias record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasRecord {
    pub subdomain: String,
    pub target: AliasTarget,
}

/// The routing verdict for one request. `Split` aliases are already
/// resolved to a concrete app by weighted random choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Serve this app.
    Proxy { app_id: String },
    /// Redirect the client.
    Redirect { url: String },
    /// A reserved surface (`admin`, `api`, `landing`, custom labels).
    Reserved { label: String },
    /// Unknown subdomain.
    None,
}

/// Normalize a Host header value: lowercase, strip port, strip trailing dot.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    let lower = host.trim().to_ascii_lowercase();
    let no_port = match lower.rsplit_once(':') {
        // Only strip when the suffix is numeric (avoid mangling IPv6).
        Some((head, tail)) if tail.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => lower.as_str(),
    };
    no_port.trim_end_matches('.').to_owned()
}

/// If `domain` is a wildcard-DNS name with an embedded IP that no longer
/// matches `local_ip`, return the refreshed domain. Real domains are never
/// rewritten.
#[must_use]
pub fn refresh_wildcard_domain(domain: &str, local_ip: &str) -> Option<String> {
    let suffix = WILDCARD_DNS_SUFFIXES
        .iter()
        .find(|s| domain.ends_with(*s))?;
    let embedded = domain.strip_suffix(suffix)?;
    // nip.io accepts both dot and dash notation; keep whichever is in use.
    let (sep, current) = if embedded.contains('-') {
        ('-', embedded.replace('-', "."))
    } else {
        ('.', embedded.to_owned())
    };
    if current == local_ip {
        return None;
    }
    let refreshed_ip = if sep == '-' {
        local_ip.replace('.', "-")
    } else {
        local_ip.to_owned()
    };
    Some(format!("{refreshed_ip}{suffix}"))
}

/// Hostname → routing decision, backed by the alias table.
pub struct AliasResolver {
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
    table: RwLock<HashMap<String, AliasRecord>>,
    base_domain: RwLock<String>,
}

impl AliasResolver {
    /// Create an empty resolver for the given base domain.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, queue: Arc<WriteQueue>, base_domain: &str) -> Self {
        Self {
            storage,
            queue,
            table: RwLock::new(HashMap::new()),
            base_domain: RwLock::new(normalize_host(base_domain)),
        }
    }

    /// Load every alias record from storage into the in-memory table.
    ///
    /// # Errors
    ///
    /// Returns [`AliasError::Storage`] or [`AliasError::Corrupt`].
    pub async fn load(&self) -> Result<usize, AliasError> {
        let pairs = self.storage.scan(ALIAS_PREFIX).await?;
        let mut table = HashMap::with_capacity(pairs.len());
        for (key, bytes) in pairs {
            let record: AliasRecord =
                serde_json::from_slice(&bytes).map_err(|e| AliasError::Corrupt {
                    subdomain: key.clone(),
                    reason: e.to_string(),
                })?;
            table.insert(record.subdomain.clone(), record);
        }
        let count = table.len();
        *self.table.write().await = table;
        info!(aliases = count, "alias table loaded");
        Ok(count)
    }

    /// Current base domain.
    pub async fn base_domain(&self) -> String {
        self.base_domain.read().await.clone()
    }

    /// Replace the base domain (wildcard-IP refresh at boot).
    pub async fn set_base_domain(&self, domain: &str) {
        *self.base_domain.write().await = normalize_host(domain);
    }

    /// Resolve a raw Host header to a routing decision.
    pub async fn resolve(&self, host: &str) -> RouteDecision {
        let host = normalize_host(host);
        let base = self.base_domain.read().await;

        // The apex serves the landing surface.
        if host == *base {
            return RouteDecision::Reserved {
                label: "landing".to_owned(),
            };
        }

        let Some(subdomain) = host
            .strip_suffix(base.as_str())
            .and_then(|s| s.strip_suffix('.'))
        else {
            return RouteDecision::None;
        };

        if RESERVED_SUBDOMAINS.contains(&subdomain) {
            return RouteDecision::Reserved {
                label: subdomain.to_owned(),
            };
        }

        let table = self.table.read().await;
        match table.get(subdomain) {
            None => RouteDecision::None,
            Some(record) => match &record.target {
                AliasTarget::Proxy { app_id } => RouteDecision::Proxy {
                    app_id: app_id.clone(),
                },
                AliasTarget::Redirect { url } => RouteDecision::Redirect { url: url.clone() },
                AliasTarget::Reserved { label } => RouteDecision::Reserved {
                    label: label.clone(),
                },
                AliasTarget::Split { targets } => match pick_split(targets) {
                    Some(app_id) => RouteDecision::Proxy { app_id },
                    None => RouteDecision::None,
                },
            },
        }
    }

    /// List all aliases, sorted by subdomain.
    pub async fn list(&self) -> Vec<AliasRecord> {
        let table = self.table.read().await;
        let mut records: Vec<AliasRecord> = table.values().cloned().collect();
        records.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        records
    }

    /// Create or retarget an alias.
    ///
    /// # Errors
    ///
    /// - [`AliasError::Reserved`] for `admin`/`api`.
    /// - [`AliasError::Invalid`] for empty subdomains or bad split weights.
    pub async fn upsert(&self, record: AliasRecord) -> Result<(), AliasError> {
        let subdomain = normalize_host(&record.subdomain);
        if subdomain.is_empty() || subdomain.contains('.') {
            return Err(AliasError::Invalid {
                reason: format!("bad subdomain '{subdomain}'"),
            });
        }
        if RESERVED_SUBDOMAINS.contains(&subdomain.as_str()) {
            return Err(AliasError::Reserved { subdomain });
        }
        if let AliasTarget::Split { targets } = &record.target {
            let total: f64 = targets.iter().map(|t| t.weight).sum();
            if targets.is_empty() || total <= 0.0 || targets.iter().any(|t| t.weight < 0.0) {
                return Err(AliasError::Invalid {
                    reason: "split weights must be non-negative and sum to a positive number"
                        .to_owned(),
                });
            }
        }

        let record = AliasRecord {
            subdomain: subdomain.clone(),
            target: record.target,
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| AliasError::Corrupt {
            subdomain: subdomain.clone(),
            reason: e.to_string(),
        })?;
        let storage = Arc::clone(&self.storage);
        let key = format!("{ALIAS_PREFIX}{subdomain}");
        self.queue
            .submit(move || async move { storage.put(&key, &bytes).await })
            .await??;

        self.table.write().await.insert(subdomain, record);
        Ok(())
    }

    /// Delete an alias.
    ///
    /// # Errors
    ///
    /// Returns [`AliasError::NotFound`] if the subdomain is unknown.
    pub async fn delete(&self, subdomain: &str) -> Result<(), AliasError> {
        let subdomain = normalize_host(subdomain);
        if !self.table.read().await.contains_key(&subdomain) {
            return Err(AliasError::NotFound { subdomain });
        }
        let storage = Arc::clone(&self.storage);
        let key = format!("{ALIAS_PREFIX}{subdomain}");
        self.queue
            .submit(move || async move { storage.delete(&key).await })
            .await??;
        self.table.write().await.remove(&subdomain);
        Ok(())
    }

    /// Drop every alias pointing at the given app (cascade from app delete).
    ///
    /// # Errors
    ///
    /// Returns [`AliasError::Queue`] or [`AliasError::Storage`].
    pub async fn delete_for_app(&self, app_id: &str) -> Result<usize, AliasError> {
        let doomed: Vec<String> = {
            let table = self.table.read().await;
            table
                .values()
                .filter(|r| targets_app(&r.target, app_id))
                .map(|r| r.subdomain.clone())
                .collect()
        };
        if doomed.is_empty() {
            return Ok(0);
        }

        let storage = Arc::clone(&self.storage);
        let keys: Vec<String> = doomed
            .iter()
            .map(|s| format!("{ALIAS_PREFIX}{s}"))
            .collect();
        self.queue
            .submit(move || async move {
                let batch = keys.into_iter().map(|k| (k, None)).collect();
                storage.put_batch(batch).await
            })
            .await??;

        let mut table = self.table.write().await;
        for subdomain in &doomed {
            table.remove(subdomain);
        }
        Ok(doomed.len())
    }

    /// Atomically exchange the targets of two proxy aliases.
    ///
    /// Both records are rewritten in a single storage transaction and the
    /// in-memory table is updated under one write lock, so a concurrent
    /// `resolve` observes either the old assignment or the new one — never
    /// a mix.
    ///
    /// # Errors
    ///
    /// - [`AliasError::NotFound`] when either subdomain is unknown.
    /// - [`AliasError::NotSwappable`] when either alias is not a proxy.
    pub async fn swap(&self, a: &str, b: &str) -> Result<(), AliasError> {
        let a = normalize_host(a);
        let b = normalize_host(b);

        let (mut rec_a, mut rec_b) = {
            let table = self.table.read().await;
            let rec_a = table
                .get(&a)
                .cloned()
                .ok_or_else(|| AliasError::NotFound {
                    subdomain: a.clone(),
                })?;
            let rec_b = table
                .get(&b)
                .cloned()
                .ok_or_else(|| AliasError::NotFound {
                    subdomain: b.clone(),
                })?;
            (rec_a, rec_b)
        };

        let (AliasTarget::Proxy { app_id: app_a }, AliasTarget::Proxy { app_id: app_b }) =
            (rec_a.target.clone(), rec_b.target.clone())
        else {
            let not_proxy = if matches!(rec_a.target, AliasTarget::Proxy { .. }) {
                b.clone()
            } else {
                a.clone()
            };
            return Err(AliasError::NotSwappable {
                subdomain: not_proxy,
            });
        };

        rec_a.target = AliasTarget::Proxy { app_id: app_b };
        rec_b.target = AliasTarget::Proxy { app_id: app_a };

        let bytes_a = serde_json::to_vec(&rec_a).map_err(|e| AliasError::Corrupt {
            subdomain: a.clone(),
            reason: e.to_string(),
        })?;
        let bytes_b = serde_json::to_vec(&rec_b).map_err(|e| AliasError::Corrupt {
            subdomain: b.clone(),
            reason: e.to_string(),
        })?;

        let storage = Arc::clone(&self.storage);
        let key_a = format!("{ALIAS_PREFIX}{a}");
        let key_b = format!("{ALIAS_PREFIX}{b}");
        self.queue
            .submit(move || async move {
                storage
                    .put_batch(vec![(key_a, Some(bytes_a)), (key_b, Some(bytes_b))])
                    .await
            })
            .await??;

        let mut table = self.table.write().await;
        table.insert(a.clone(), rec_a);
        table.insert(b.clone(), rec_b);
        info!(a = %a, b = %b, "aliases swapped");
        Ok(())
    }
}

fn targets_app(target: &AliasTarget, app_id: &str) -> bool {
    match target {
        AliasTarget::Proxy { app_id: id } => id == app_id,
        AliasTarget::Split { targets } => targets.iter().any(|t| t.app_id == app_id),
        AliasTarget::Redirect { .. } | AliasTarget::Reserved { .. } => false,
    }
}

/// Weighted random choice over split targets; weights are normalized here.
fn pick_split(targets: &[SplitTarget]) -> Option<String> {
    let total: f64 = targets.iter().map(|t| t.weight.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }
    let mut roll = rand::thread_rng().gen_range(0.0..total);
    for target in targets {
        let w = target.weight.max(0.0);
        if roll < w {
            return Some(target.app_id.clone());
        }
        roll -= w;
    }
    targets.last().map(|t| t.app_id.clone())
}

impl std::fmt::Debug for AliasResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliasResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_storage::MemoryBackend;

    fn resolver() -> AliasResolver {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        AliasResolver::new(storage, queue, "fazt.local")
    }

    fn proxy(subdomain: &str, app_id: &str) -> AliasRecord {
        AliasRecord {
            subdomain: subdomain.to_owned(),
            target: AliasTarget::Proxy {
                app_id: app_id.to_owned(),
            },
        }
    }

    #[test]
    fn normalize_strips_port_case_and_dot() {
        assert_eq!(normalize_host("Blog.Fazt.Local:8080"), "blog.fazt.local");
        assert_eq!(normalize_host("blog.fazt.local."), "blog.fazt.local");
        assert_eq!(normalize_host("BLOG.FAZT.LOCAL"), "blog.fazt.local");
    }

    #[tokio::test]
    async fn resolve_proxy_alias() {
        let resolver = resolver();
        resolver.upsert(proxy("blog", "app1")).await.unwrap();

        let decision = resolver.resolve("blog.fazt.local:80").await;
        assert_eq!(
            decision,
            RouteDecision::Proxy {
                app_id: "app1".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn resolve_unknown_is_none() {
        let resolver = resolver();
        assert_eq!(resolver.resolve("nope.fazt.local").await, RouteDecision::None);
        assert_eq!(resolver.resolve("other.domain").await, RouteDecision::None);
    }

    #[tokio::test]
    async fn apex_and_reserved_short_circuit() {
        let resolver = resolver();
        assert_eq!(
            resolver.resolve("fazt.local").await,
            RouteDecision::Reserved {
                label: "landing".to_owned()
            }
        );
        assert_eq!(
            resolver.resolve("admin.fazt.local").await,
            RouteDecision::Reserved {
                label: "admin".to_owned()
            }
        );
        assert_eq!(
            resolver.resolve("api.fazt.local").await,
            RouteDecision::Reserved {
                label: "api".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn reserved_subdomains_cannot_be_claimed() {
        let resolver = resolver();
        let err = resolver.upsert(proxy("admin", "app1")).await.unwrap_err();
        assert!(matches!(err, AliasError::Reserved { .. }));
    }

    #[tokio::test]
    async fn load_restores_persisted_table() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        {
            let resolver =
                AliasResolver::new(Arc::clone(&storage), Arc::clone(&queue), "fazt.local");
            resolver.upsert(proxy("blog", "app1")).await.unwrap();
        }
        let resolver = AliasResolver::new(storage, queue, "fazt.local");
        assert_eq!(resolver.load().await.unwrap(), 1);
        assert_eq!(
            resolver.resolve("blog.fazt.local").await,
            RouteDecision::Proxy {
                app_id: "app1".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn split_resolves_to_some_listed_target() {
        let resolver = resolver();
        resolver
            .upsert(AliasRecord {
                subdomain: "canary".to_owned(),
                target: AliasTarget::Split {
                    targets: vec![
                        SplitTarget {
                            app_id: "stable".to_owned(),
                            weight: 9.0,
                        },
                        SplitTarget {
                            app_id: "next".to_owned(),
                            weight: 1.0,
                        },
                    ],
                },
            })
            .await
            .unwrap();

        for _ in 0..50 {
            match resolver.resolve("canary.fazt.local").await {
                RouteDecision::Proxy { app_id } => {
                    assert!(app_id == "stable" || app_id == "next");
                }
                other => panic!("unexpected decision: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn zero_weight_targets_are_never_picked() {
        let targets = vec![
            SplitTarget {
                app_id: "never".to_owned(),
                weight: 0.0,
            },
            SplitTarget {
                app_id: "always".to_owned(),
                weight: 1.0,
            },
        ];
        for _ in 0..50 {
            assert_eq!(pick_split(&targets).as_deref(), Some("always"));
        }
    }

    #[tokio::test]
    async fn swap_exchanges_proxy_targets() {
        let resolver = resolver();
        resolver.upsert(proxy("a", "app1")).await.unwrap();
        resolver.upsert(proxy("b", "app2")).await.unwrap();

        resolver.swap("a", "b").await.unwrap();

        assert_eq!(
            resolver.resolve("a.fazt.local").await,
            RouteDecision::Proxy {
                app_id: "app2".to_owned()
            }
        );
        assert_eq!(
            resolver.resolve("b.fazt.local").await,
            RouteDecision::Proxy {
                app_id: "app1".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn swap_rejects_non_proxy() {
        let resolver = resolver();
        resolver.upsert(proxy("a", "app1")).await.unwrap();
        resolver
            .upsert(AliasRecord {
                subdomain: "b".to_owned(),
                target: AliasTarget::Redirect {
                    url: "https://example.com".to_owned(),
                },
            })
            .await
            .unwrap();

        let err = resolver.swap("a", "b").await.unwrap_err();
        assert!(matches!(err, AliasError::NotSwappable { .. }));
    }

    #[tokio::test]
    async fn delete_for_app_cascades() {
        let resolver = resolver();
        resolver.upsert(proxy("blog", "app1")).await.unwrap();
        resolver.upsert(proxy("docs", "app1")).await.unwrap();
        resolver.upsert(proxy("other", "app2")).await.unwrap();

        let removed = resolver.delete_for_app("app1").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(resolver.resolve("blog.fazt.local").await, RouteDecision::None);
        assert!(matches!(
            resolver.resolve("other.fazt.local").await,
            RouteDecision::Proxy { .. }
        ));
    }

    #[test]
    fn wildcard_domain_refreshes_stale_ip() {
        assert_eq!(
            refresh_wildcard_domain("10.0.0.5.nip.io", "192.168.1.2"),
            Some("192.168.1.2.nip.io".to_owned())
        );
        assert_eq!(
            refresh_wildcard_domain("10-0-0-5.nip.io", "192.168.1.2"),
            Some("192-168-1-2.nip.io".to_owned())
        );
        // Already current — no rewrite.
        assert_eq!(refresh_wildcard_domain("192.168.1.2.nip.io", "192.168.1.2"), None);
        // Real domains are never rewritten.
        assert_eq!(refresh_wildcard_domain("example.com", "192.168.1.2"), None);
    }
}
