//! Admission of new executions.
//!
//! Webhook-triggered starts pass three checks, always in this order:
//! 1. authentication against the webhook's [`AuthenticationType`],
//! 2. the webhook's fixed-window rate limit,
//! 3. the tenant's concurrent-execution ceiling.
//!
//! Direct starts skip the first two. Passing the capacity check yields a
//! [`TenantSlot`]; the running count is decremented when the slot is dropped,
//! which the scheduler does once the execution reaches a terminal status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::AdmissionError;
use crate::models::{AuthenticationType, RateLimit, WebhookConfig};
use crate::tenant::TenantRegistry;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// An inbound webhook call as seen by the gate.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Header names are stored lower-cased.
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl WebhookRequest {
    pub fn new<K, V>(
        headers: impl IntoIterator<Item = (K, V)>,
        body: impl Into<Vec<u8>>,
        received_at: DateTime<Utc>,
    ) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
            body: body.into(),
            received_at,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The trigger input carried by the body: parsed JSON, `null` for an
    /// empty body, `{"raw": ...}` otherwise.
    pub fn trigger_input(&self) -> Value {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Value::Null;
        }
        serde_json::from_slice(&self.body)
            .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(&self.body) }))
    }
}

/// Hex HMAC-SHA256 of `body` keyed with `secret`, as expected by
/// [`AuthenticationType::Signature`].
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Compare two secrets in time independent of their contents and lengths.
/// Both sides are hashed first so only fixed-size digests are compared.
fn secrets_match(provided: &[u8], expected: &[u8]) -> bool {
    let provided = Sha256::digest(provided);
    let expected = Sha256::digest(expected);
    provided
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check `request` against `auth`. No side effects.
pub fn authenticate(auth: &AuthenticationType, request: &WebhookRequest) -> Result<(), AdmissionError> {
    match auth {
        AuthenticationType::None => Ok(()),
        AuthenticationType::SharedSecret { header, secret } => {
            let provided = request.header(header).ok_or(AdmissionError::AuthenticationFailed)?;
            if secrets_match(provided.as_bytes(), secret.as_bytes()) {
                Ok(())
            } else {
                Err(AdmissionError::AuthenticationFailed)
            }
        }
        AuthenticationType::Signature { header, secret } => {
            let provided = request.header(header).ok_or(AdmissionError::AuthenticationFailed)?;
            let digest = provided.trim();
            let digest = digest.strip_prefix("sha256=").unwrap_or(digest);
            let signature = hex::decode(digest).map_err(|_| AdmissionError::AuthenticationFailed)?;
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|_| AdmissionError::AuthenticationFailed)?;
            mac.update(&request.body);
            mac.verify_slice(&signature)
                .map_err(|_| AdmissionError::AuthenticationFailed)
        }
    }
}

// ---------------------------------------------------------------------------
// Quota bookkeeping
// ---------------------------------------------------------------------------

/// Per-webhook admission counter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitWindow {
    pub window_start: DateTime<Utc>,
    pub count: u32,
    pub limit: u32,
}

/// Snapshot of a tenant's concurrency usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TenantQuota {
    pub max_concurrent_executions: usize,
    pub current_running: usize,
}

/// One reserved unit of a tenant's concurrency. Dropping it frees the unit.
#[derive(Debug)]
pub struct TenantSlot {
    tenant_id: Uuid,
    running: Arc<DashMap<Uuid, usize>>,
}

impl TenantSlot {
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }
}

impl Drop for TenantSlot {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.get_mut(&self.tenant_id) {
            *running = running.saturating_sub(1);
        }
        // Idle tenants keep no entry; a concurrent reserve re-creates it.
        self.running.remove_if(&self.tenant_id, |_, running| *running == 0);
    }
}

/// A request that passed every admission check.
#[derive(Debug)]
pub struct Admission {
    pub trigger_input: Value,
    pub slot: TenantSlot,
}

// ---------------------------------------------------------------------------
// AdmissionGate
// ---------------------------------------------------------------------------

/// Holds webhook bindings, rate-limit windows and tenant running counts.
///
/// Each window and each tenant counter is only touched while its map entry
/// is locked, so check-and-increment is atomic per key.
pub struct AdmissionGate {
    tenants: Arc<dyn TenantRegistry>,
    webhooks: DashMap<String, WebhookConfig>,
    windows: DashMap<String, RateLimitWindow>,
    running: Arc<DashMap<Uuid, usize>>,
}

impl AdmissionGate {
    pub fn new(tenants: Arc<dyn TenantRegistry>) -> Self {
        Self {
            tenants,
            webhooks: DashMap::new(),
            windows: DashMap::new(),
            running: Arc::new(DashMap::new()),
        }
    }

    /// Register or replace a webhook binding. Replacing keeps the current
    /// rate-limit window.
    pub fn register_webhook(&self, config: WebhookConfig) {
        debug!(webhook_id = %config.id, tenant_id = %config.tenant_id, "webhook registered");
        self.webhooks.insert(config.id.clone(), config);
    }

    pub fn unregister_webhook(&self, webhook_id: &str) {
        self.webhooks.remove(webhook_id);
        self.windows.remove(webhook_id);
    }

    pub fn webhook(&self, webhook_id: &str) -> Option<WebhookConfig> {
        self.webhooks.get(webhook_id).map(|c| c.clone())
    }

    /// Admit a webhook-triggered start.
    #[instrument(skip(self, request))]
    pub fn admit(
        &self,
        webhook_id: &str,
        tenant_id: Uuid,
        request: &WebhookRequest,
    ) -> Result<Admission, AdmissionError> {
        let config = self
            .webhook(webhook_id)
            .ok_or_else(|| AdmissionError::UnknownWebhook(webhook_id.to_owned()))?;

        // A webhook only starts executions for the tenant that owns it.
        if config.tenant_id != tenant_id {
            warn!("webhook is not owned by the requesting tenant");
            return Err(AdmissionError::AuthenticationFailed);
        }

        authenticate(&config.auth, request).inspect_err(|_| {
            warn!("webhook authentication failed");
        })?;
        self.check_rate_limit(webhook_id, config.rate_limit, request.received_at)?;
        let slot = self.reserve(tenant_id)?;

        Ok(Admission {
            trigger_input: request.trigger_input(),
            slot,
        })
    }

    /// Count one admission against the webhook's current window.
    ///
    /// A request at or past `window_start + window` opens a new window. A
    /// rejected request does not consume capacity.
    pub fn check_rate_limit(
        &self,
        webhook_id: &str,
        rate_limit: RateLimit,
        now: DateTime<Utc>,
    ) -> Result<(), AdmissionError> {
        let window = chrono::Duration::seconds(rate_limit.window_secs.min(u32::MAX as u64) as i64);

        let mut entry = self
            .windows
            .entry(webhook_id.to_owned())
            .or_insert_with(|| RateLimitWindow {
                window_start: now,
                count: 0,
                limit: rate_limit.limit,
            });

        entry.limit = rate_limit.limit;
        if now >= entry.window_start + window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= entry.limit {
            let retry_after = (entry.window_start + window - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(webhook_id, count = entry.count, "rate limited");
            return Err(AdmissionError::RateLimited {
                webhook_id: webhook_id.to_owned(),
                retry_after,
            });
        }

        entry.count += 1;
        Ok(())
    }

    /// Reserve one concurrent execution for `tenant_id`.
    pub fn reserve(&self, tenant_id: Uuid) -> Result<TenantSlot, AdmissionError> {
        let limit = self.tenants.limits(tenant_id).max_concurrent_executions;

        let mut running = self.running.entry(tenant_id).or_insert(0);
        if *running >= limit {
            return Err(AdmissionError::TenantAtCapacity { tenant_id, limit });
        }
        *running += 1;
        drop(running);

        Ok(TenantSlot {
            tenant_id,
            running: Arc::clone(&self.running),
        })
    }

    /// Reject plans larger than the tenant allows.
    pub fn check_step_limit(&self, tenant_id: Uuid, steps: usize) -> Result<(), AdmissionError> {
        let limit = self.tenants.limits(tenant_id).max_steps_per_workflow;
        if steps > limit {
            return Err(AdmissionError::StepLimitExceeded { steps, limit });
        }
        Ok(())
    }

    pub fn quota(&self, tenant_id: Uuid) -> TenantQuota {
        TenantQuota {
            max_concurrent_executions: self.tenants.limits(tenant_id).max_concurrent_executions,
            current_running: self.running.get(&tenant_id).map(|n| *n).unwrap_or(0),
        }
    }

    pub fn rate_limit_window(&self, webhook_id: &str) -> Option<RateLimitWindow> {
        self.windows.get(webhook_id).map(|w| w.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{InMemoryTenantRegistry, TenantLimits};
    use chrono::TimeZone;

    fn gate_with_limit(max_concurrent: usize) -> AdmissionGate {
        AdmissionGate::new(Arc::new(InMemoryTenantRegistry::new(TenantLimits {
            max_concurrent_executions: max_concurrent,
            max_steps_per_workflow: 10,
        })))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn webhook(tenant_id: Uuid, auth: AuthenticationType, limit: u32) -> WebhookConfig {
        WebhookConfig {
            id: "orders".into(),
            tenant_id,
            auth,
            rate_limit: RateLimit { limit, window_secs: 60 },
        }
    }

    fn request(headers: Vec<(&str, String)>, body: &str, secs: i64) -> WebhookRequest {
        WebhookRequest::new(headers, body.as_bytes().to_vec(), at(secs))
    }

    #[test]
    fn three_per_window_then_rate_limited_then_new_window() {
        let gate = gate_with_limit(100);
        let tenant = Uuid::new_v4();
        gate.register_webhook(webhook(tenant, AuthenticationType::None, 3));

        let mut slots = Vec::new();
        for secs in [0, 10, 20] {
            slots.push(gate.admit("orders", tenant, &request(vec![], "{}", secs)).expect("admitted"));
        }

        let err = gate.admit("orders", tenant, &request(vec![], "{}", 30)).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::RateLimited { ref retry_after, .. } if *retry_after == Duration::from_secs(30)
        ));
        assert_eq!(gate.rate_limit_window("orders").unwrap().count, 3);

        assert!(gate.admit("orders", tenant, &request(vec![], "{}", 60)).is_ok());
        let window = gate.rate_limit_window("orders").unwrap();
        assert_eq!(window.window_start, at(60));
        assert_eq!(window.count, 1);
    }

    #[test]
    fn shared_secret_must_match() {
        let gate = gate_with_limit(10);
        let tenant = Uuid::new_v4();
        gate.register_webhook(webhook(
            tenant,
            AuthenticationType::SharedSecret { header: "X-Token".into(), secret: "s3cret".into() },
            10,
        ));

        let wrong = request(vec![("x-token", "nope".into())], "{}", 0);
        assert_eq!(
            gate.admit("orders", tenant, &wrong).unwrap_err(),
            AdmissionError::AuthenticationFailed
        );
        let missing = request(vec![], "{}", 0);
        assert!(gate.admit("orders", tenant, &missing).is_err());

        let ok = request(vec![("X-TOKEN", "s3cret".into())], "{}", 0);
        assert!(gate.admit("orders", tenant, &ok).is_ok());
    }

    #[test]
    fn failed_authentication_has_no_side_effects() {
        let gate = gate_with_limit(10);
        let tenant = Uuid::new_v4();
        gate.register_webhook(webhook(
            tenant,
            AuthenticationType::SharedSecret { header: "x-token".into(), secret: "s3cret".into() },
            10,
        ));

        let _ = gate.admit("orders", tenant, &request(vec![], "{}", 0));
        assert!(gate.rate_limit_window("orders").is_none());
        assert_eq!(gate.quota(tenant).current_running, 0);
    }

    #[test]
    fn signature_is_verified_over_raw_body() {
        let gate = gate_with_limit(10);
        let tenant = Uuid::new_v4();
        gate.register_webhook(webhook(
            tenant,
            AuthenticationType::Signature { header: "x-signature-256".into(), secret: "key".into() },
            10,
        ));

        let body = r#"{"order":42}"#;
        let signed = request(
            vec![("x-signature-256", format!("sha256={}", sign_body("key", body.as_bytes()).unwrap()))],
            body,
            0,
        );
        let admission = gate.admit("orders", tenant, &signed).expect("valid signature");
        assert_eq!(admission.trigger_input, json!({ "order": 42 }));

        let tampered = request(
            vec![("x-signature-256", sign_body("key", body.as_bytes()).unwrap())],
            r#"{"order":43}"#,
            0,
        );
        assert_eq!(
            gate.admit("orders", tenant, &tampered).unwrap_err(),
            AdmissionError::AuthenticationFailed
        );

        let garbage = request(vec![("x-signature-256", "zz".into())], body, 0);
        assert!(gate.admit("orders", tenant, &garbage).is_err());
    }

    #[test]
    fn tenant_capacity_is_released_when_slot_drops() {
        let gate = gate_with_limit(1);
        let tenant = Uuid::new_v4();

        let first = gate.reserve(tenant).expect("first slot");
        assert_eq!(
            gate.reserve(tenant).unwrap_err(),
            AdmissionError::TenantAtCapacity { tenant_id: tenant, limit: 1 }
        );
        assert_eq!(gate.quota(tenant).current_running, 1);

        drop(first);
        assert_eq!(gate.quota(tenant).current_running, 0);
        assert!(gate.reserve(tenant).is_ok());
    }

    #[test]
    fn capacity_rejection_after_rate_limit_still_counts_request() {
        let gate = gate_with_limit(0);
        let tenant = Uuid::new_v4();
        gate.register_webhook(webhook(tenant, AuthenticationType::None, 5));

        let err = gate.admit("orders", tenant, &request(vec![], "{}", 0)).unwrap_err();
        assert!(matches!(err, AdmissionError::TenantAtCapacity { limit: 0, .. }));
        assert_eq!(gate.rate_limit_window("orders").unwrap().count, 1);
    }

    #[test]
    fn unknown_webhook_and_foreign_tenant_are_rejected() {
        let gate = gate_with_limit(10);
        let owner = Uuid::new_v4();
        gate.register_webhook(webhook(owner, AuthenticationType::None, 10));

        assert_eq!(
            gate.admit("missing", owner, &request(vec![], "", 0)).unwrap_err(),
            AdmissionError::UnknownWebhook("missing".into())
        );
        assert_eq!(
            gate.admit("orders", Uuid::new_v4(), &request(vec![], "", 0)).unwrap_err(),
            AdmissionError::AuthenticationFailed
        );
    }

    #[test]
    fn trigger_input_parsing() {
        assert_eq!(request(vec![], "", 0).trigger_input(), Value::Null);
        assert_eq!(request(vec![], " [1,2] ", 0).trigger_input(), json!([1, 2]));
        assert_eq!(request(vec![], "a=b", 0).trigger_input(), json!({ "raw": "a=b" }));
    }

    #[test]
    fn step_limit() {
        let gate = gate_with_limit(1);
        let tenant = Uuid::new_v4();
        assert!(gate.check_step_limit(tenant, 10).is_ok());
        assert_eq!(
            gate.check_step_limit(tenant, 11).unwrap_err(),
            AdmissionError::StepLimitExceeded { steps: 11, limit: 10 }
        );
    }

    #[test]
    fn concurrent_reservations_never_exceed_limit() {
        let gate = Arc::new(gate_with_limit(5));
        let tenant = Uuid::new_v4();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.reserve(tenant).ok())
            })
            .collect();
        let slots: Vec<TenantSlot> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(slots.len(), 5);
        assert_eq!(gate.quota(tenant).current_running, 5);
    }

    #[test]
    fn concurrent_requests_never_exceed_rate_limit() {
        let gate = Arc::new(gate_with_limit(100));
        let limit = RateLimit { limit: 5, window_secs: 60 };

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.check_rate_limit("orders", limit, at(0)).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 5);
        assert_eq!(gate.rate_limit_window("orders").unwrap().count, 5);
    }

    #[test]
    fn idle_tenants_leave_no_running_entry() {
        let gate = gate_with_limit(3);
        let tenants: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();

        let slots: Vec<TenantSlot> = tenants.iter().map(|t| gate.reserve(*t).unwrap()).collect();
        assert_eq!(gate.running.len(), 50);
        drop(slots);
        assert!(gate.running.is_empty());

        let kept = gate.reserve(tenants[0]).unwrap();
        let second = gate.reserve(tenants[0]).unwrap();
        drop(second);
        assert_eq!(gate.quota(tenants[0]).current_running, 1);
        drop(kept);
        assert_eq!(gate.quota(tenants[0]).current_running, 0);
        assert!(gate.running.is_empty());
    }

    #[test]
    fn secret_comparison_ignores_length_prefixes() {
        assert!(secrets_match(b"s3cret", b"s3cret"));
        assert!(!secrets_match(b"s3c", b"s3cret"));
        assert!(!secrets_match(b"s3cret-and-more", b"s3cret"));
        assert!(!secrets_match(b"", b"s3cret"));
    }
}
