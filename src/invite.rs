//! Demo coordinator - invite validation and audit
//!
//! Invite records live in the external key-value store under
//! `invite:<token>` as JSON. The validation decision itself is a pure
//! function over the loaded record plus a snapshot of who currently holds
//! or awaits a session (for rejoin eligibility); store I/O wraps it.

use std::net::IpAddr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::AUDIT_RETENTION_DAYS;
use crate::store::{KeyValueStore, TTL_MISSING, TTL_NONE};
use crate::telemetry::Metrics;

const MIN_TOKEN_LEN: usize = 4;
const MAX_TOKEN_LEN: usize = 64;
const ONE_DAY_SECS: u64 = 86_400;

pub fn invite_key(token: &str) -> String {
    format!("invite:{}", token)
}

/// Token syntax gate, checked before any store lookup
pub fn token_syntax_valid(token: &str) -> bool {
    (MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&token.len())
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Lifecycle status stored on the invite record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Active,
    Used,
    Revoked,
    Expired,
}

/// One end-of-session audit entry, appended to the invite record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAudit {
    pub session_id: Uuid,
    pub client_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: String,
    pub queue_wait_ms: u64,
    pub source_address: String,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// The JSON invite record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRecord {
    pub expires_at: DateTime<Utc>,
    pub max_uses: u32,
    pub use_count: u32,
    pub status: InviteStatus,
    #[serde(default)]
    pub sessions: Vec<SessionAudit>,
}

impl InviteRecord {
    pub fn exhausted(&self) -> bool {
        self.status == InviteStatus::Used || self.use_count >= self.max_uses
    }
}

/// Why an invite was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Invalid,
    NotFound,
    Revoked,
    Used,
    Expired,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::NotFound => "not_found",
            Self::Revoked => "revoked",
            Self::Used => "used",
            Self::Expired => "expired",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Invalid => "Invalid invite token format",
            Self::NotFound => "Invite token not found",
            Self::Revoked => "Invite token has been revoked",
            Self::Used => "Invite token has already been used",
            Self::Expired => "Invite token has expired",
        }
    }
}

/// Validation outcome
#[derive(Debug, Clone)]
pub enum Validation {
    Valid { rejoin: bool },
    Invalid(Rejection),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    /// Metric label for this decision
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Valid { rejoin: false } => "valid",
            Self::Valid { rejoin: true } => "rejoin",
            Self::Invalid(r) => r.as_str(),
        }
    }
}

/// Snapshot of invite/source pairs currently attached to the active session
/// and to pending-token entries, taken under the coordinator lock before the
/// store round trip.
#[derive(Debug, Clone, Default)]
pub struct RejoinContext {
    pub active: Option<(String, IpAddr)>,
    pub pending: Vec<(String, IpAddr)>,
}

impl RejoinContext {
    fn matches(&self, token: &str, source: IpAddr) -> bool {
        let hit = |entry: &(String, IpAddr)| entry.0 == token && entry.1 == source;
        self.active.as_ref().map(hit).unwrap_or(false) || self.pending.iter().any(hit)
    }
}

/// The pure decision. Returns the validation outcome and whether the record
/// should be written back with status `expired`.
pub fn decide(
    token: &str,
    record: Option<&InviteRecord>,
    now: DateTime<Utc>,
    source: IpAddr,
    ctx: &RejoinContext,
) -> (Validation, bool) {
    let Some(record) = record else {
        return (Validation::Invalid(Rejection::NotFound), false);
    };

    if record.status == InviteStatus::Revoked {
        return (Validation::Invalid(Rejection::Revoked), false);
    }

    if record.exhausted() {
        if ctx.matches(token, source) {
            return (Validation::Valid { rejoin: true }, false);
        }
        return (Validation::Invalid(Rejection::Used), false);
    }

    if record.expires_at < now {
        return (
            Validation::Invalid(Rejection::Expired),
            record.status != InviteStatus::Expired,
        );
    }

    (Validation::Valid { rejoin: false }, false)
}

pub async fn load_invite(
    store: &dyn KeyValueStore,
    token: &str,
) -> Result<Option<InviteRecord>, crate::store::StoreError> {
    match store.get(&invite_key(token)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Validate an invite token. `side_effects` controls whether an
/// expired-on-read record is written back with status `expired` (the
/// reverse-proxy sub-request path validates without side effects).
/// Store failures fail closed as `not_found`.
pub async fn validate(
    store: &dyn KeyValueStore,
    token: &str,
    source: IpAddr,
    ctx: &RejoinContext,
    metrics: &Metrics,
    side_effects: bool,
) -> Validation {
    let span = tracing::info_span!("invite.validate");
    async {
        if !token_syntax_valid(token) {
            metrics.inc_invites_validated("invalid");
            return Validation::Invalid(Rejection::Invalid);
        }

        let record = match load_invite(store, token).await {
            Ok(record) => record,
            Err(e) => {
                warn!("invite lookup failed, failing closed: {}", e);
                metrics.inc_invites_validated("not_found");
                return Validation::Invalid(Rejection::NotFound);
            }
        };

        let (validation, mark_expired) = decide(token, record.as_ref(), Utc::now(), source, ctx);

        if mark_expired && side_effects {
            // Keep the record around for audit reads: existing TTL, at
            // least one day.
            if let Some(mut record) = record {
                record.status = InviteStatus::Expired;
                let ttl = match store.ttl(&invite_key(token)).await {
                    Ok(TTL_MISSING) | Ok(TTL_NONE) => ONE_DAY_SECS,
                    Ok(t) => (t as u64).max(ONE_DAY_SECS),
                    Err(_) => ONE_DAY_SECS,
                };
                if let Err(e) = save_invite(store, token, &record, ttl).await {
                    warn!("failed to mark invite expired: {}", e);
                }
            }
        }

        metrics.inc_invites_validated(validation.status_label());
        validation
    }
    .instrument(span)
    .await
}

async fn save_invite(
    store: &dyn KeyValueStore,
    token: &str,
    record: &InviteRecord,
    ttl_secs: u64,
) -> Result<(), crate::store::StoreError> {
    let raw = serde_json::to_string(record)?;
    store.set_ex(&invite_key(token), &raw, ttl_secs).await
}

/// Append an end-of-session audit entry and bump the use count. Called on
/// every session end that carried an invite. Failures are logged and
/// swallowed; audit loss must never block the user-visible end path.
pub async fn record_session_audit(store: &dyn KeyValueStore, token: &str, entry: SessionAudit) {
    let mut record = match load_invite(store, token).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!("invite {} missing during audit write", token);
            return;
        }
        Err(e) => {
            warn!("invite read failed during audit write: {}", e);
            return;
        }
    };

    record.sessions.push(entry);
    record.use_count += 1;
    if record.use_count >= record.max_uses {
        record.status = InviteStatus::Used;
    }

    let now = Utc::now();
    let retention_deadline = record.expires_at + ChronoDuration::days(AUDIT_RETENTION_DAYS);
    let ttl_secs = (retention_deadline - now)
        .num_seconds()
        .max(ONE_DAY_SECS as i64) as u64;

    match save_invite(store, token, &record, ttl_secs).await {
        Ok(()) => info!(
            "invite {} audited: use_count={}, status={:?}",
            token, record.use_count, record.status
        ),
        Err(e) => warn!("invite audit write failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn active_record(expires_in_hours: i64) -> InviteRecord {
        InviteRecord {
            expires_at: Utc::now() + ChronoDuration::hours(expires_in_hours),
            max_uses: 1,
            use_count: 0,
            status: InviteStatus::Active,
            sessions: Vec::new(),
        }
    }

    fn used_record() -> InviteRecord {
        InviteRecord {
            expires_at: Utc::now() + ChronoDuration::hours(1),
            max_uses: 1,
            use_count: 1,
            status: InviteStatus::Used,
            sessions: Vec::new(),
        }
    }

    async fn seed(store: &MemoryStore, token: &str, record: &InviteRecord) {
        store.insert(
            &invite_key(token),
            &serde_json::to_string(record).unwrap(),
            Some(3600),
        );
    }

    // -- Syntax ----------------------------------------------------------

    #[test]
    fn test_token_syntax_accepts_url_safe_alphabet() {
        assert!(token_syntax_valid("abcD_19-"));
        assert!(token_syntax_valid("aaaa"));
        assert!(token_syntax_valid(&"a".repeat(64)));
    }

    #[test]
    fn test_token_syntax_rejects_bad_lengths_and_chars() {
        assert!(!token_syntax_valid("abc"));
        assert!(!token_syntax_valid(&"a".repeat(65)));
        assert!(!token_syntax_valid("has space"));
        assert!(!token_syntax_valid("semi;colon"));
        assert!(!token_syntax_valid(""));
    }

    // -- decide() ordering ----------------------------------------------

    #[test]
    fn test_decide_missing_record_is_not_found() {
        let (v, wb) = decide("tok1", None, Utc::now(), ip(7), &RejoinContext::default());
        assert!(matches!(v, Validation::Invalid(Rejection::NotFound)));
        assert!(!wb);
    }

    #[test]
    fn test_decide_revoked_takes_precedence_over_used() {
        let mut record = used_record();
        record.status = InviteStatus::Revoked;

        let (v, _) = decide(
            "tok1",
            Some(&record),
            Utc::now(),
            ip(7),
            &RejoinContext::default(),
        );
        assert!(matches!(v, Validation::Invalid(Rejection::Revoked)));
    }

    #[test]
    fn test_decide_used_checked_before_expiry() {
        // A used record that is also past its expiry reports "used"
        let mut record = used_record();
        record.expires_at = Utc::now() - ChronoDuration::hours(1);

        let (v, wb) = decide(
            "tok1",
            Some(&record),
            Utc::now(),
            ip(7),
            &RejoinContext::default(),
        );
        assert!(matches!(v, Validation::Invalid(Rejection::Used)));
        assert!(!wb);
    }

    #[test]
    fn test_decide_use_count_at_max_counts_as_used() {
        let mut record = active_record(1);
        record.use_count = 1; // max_uses = 1, status still active

        let (v, _) = decide(
            "tok1",
            Some(&record),
            Utc::now(),
            ip(7),
            &RejoinContext::default(),
        );
        assert!(matches!(v, Validation::Invalid(Rejection::Used)));
    }

    #[test]
    fn test_decide_expired_requests_write_back_once() {
        let record = active_record(-1);

        let (v, wb) = decide(
            "tok1",
            Some(&record),
            Utc::now(),
            ip(7),
            &RejoinContext::default(),
        );
        assert!(matches!(v, Validation::Invalid(Rejection::Expired)));
        assert!(wb);

        // Already marked expired: no second write-back
        let mut marked = record;
        marked.status = InviteStatus::Expired;
        let (_, wb2) = decide(
            "tok1",
            Some(&marked),
            Utc::now(),
            ip(7),
            &RejoinContext::default(),
        );
        assert!(!wb2);
    }

    #[test]
    fn test_decide_fresh_record_is_valid() {
        let record = active_record(1);

        let (v, _) = decide(
            "tok1",
            Some(&record),
            Utc::now(),
            ip(7),
            &RejoinContext::default(),
        );
        assert!(matches!(v, Validation::Valid { rejoin: false }));
    }

    // -- Rejoin eligibility ----------------------------------------------

    #[test]
    fn test_rejoin_allowed_for_matching_active_session() {
        let ctx = RejoinContext {
            active: Some(("tok1".to_string(), ip(7))),
            pending: Vec::new(),
        };

        let (v, _) = decide("tok1", Some(&used_record()), Utc::now(), ip(7), &ctx);
        assert!(matches!(v, Validation::Valid { rejoin: true }));
    }

    #[test]
    fn test_rejoin_allowed_for_matching_pending_entry() {
        let ctx = RejoinContext {
            active: None,
            pending: vec![("tok1".to_string(), ip(7))],
        };

        let (v, _) = decide("tok1", Some(&used_record()), Utc::now(), ip(7), &ctx);
        assert!(matches!(v, Validation::Valid { rejoin: true }));
    }

    #[test]
    fn test_rejoin_rejected_for_different_source_address() {
        let ctx = RejoinContext {
            active: Some(("tok1".to_string(), ip(7))),
            pending: Vec::new(),
        };

        let (v, _) = decide("tok1", Some(&used_record()), Utc::now(), ip(8), &ctx);
        assert!(matches!(v, Validation::Invalid(Rejection::Used)));
    }

    #[test]
    fn test_rejoin_rejected_for_different_invite() {
        let ctx = RejoinContext {
            active: Some(("other".to_string(), ip(7))),
            pending: Vec::new(),
        };

        let (v, _) = decide("tok1", Some(&used_record()), Utc::now(), ip(7), &ctx);
        assert!(matches!(v, Validation::Invalid(Rejection::Used)));
    }

    // -- validate() against the store -----------------------------------

    #[tokio::test]
    async fn test_validate_syntax_rejected_before_lookup() {
        let store = MemoryStore::new();
        store.set_failing(true); // a lookup would error; syntax check runs first
        let metrics = Metrics::new();

        let v = validate(
            &store,
            "no spaces allowed",
            ip(7),
            &RejoinContext::default(),
            &metrics,
            true,
        )
        .await;

        assert!(matches!(v, Validation::Invalid(Rejection::Invalid)));
    }

    #[tokio::test]
    async fn test_validate_fails_closed_on_store_error() {
        let store = MemoryStore::new();
        store.set_failing(true);
        let metrics = Metrics::new();

        let v = validate(
            &store,
            "tok1",
            ip(7),
            &RejoinContext::default(),
            &metrics,
            true,
        )
        .await;

        assert!(matches!(v, Validation::Invalid(Rejection::NotFound)));
    }

    #[tokio::test]
    async fn test_validate_marks_expired_with_side_effects() {
        let store = MemoryStore::new();
        seed(&store, "tok1", &active_record(-1)).await;
        let metrics = Metrics::new();

        let v = validate(
            &store,
            "tok1",
            ip(7),
            &RejoinContext::default(),
            &metrics,
            true,
        )
        .await;

        assert!(matches!(v, Validation::Invalid(Rejection::Expired)));
        let stored: InviteRecord =
            serde_json::from_str(&store.raw(&invite_key("tok1")).unwrap()).unwrap();
        assert_eq!(stored.status, InviteStatus::Expired);
        // Existing TTL was under a day; floor applies
        assert_eq!(store.recorded_ttl(&invite_key("tok1")), Some(86_400));
    }

    #[tokio::test]
    async fn test_validate_without_side_effects_leaves_record_alone() {
        let store = MemoryStore::new();
        seed(&store, "tok1", &active_record(-1)).await;
        let metrics = Metrics::new();

        let v = validate(
            &store,
            "tok1",
            ip(7),
            &RejoinContext::default(),
            &metrics,
            false,
        )
        .await;

        assert!(matches!(v, Validation::Invalid(Rejection::Expired)));
        let stored: InviteRecord =
            serde_json::from_str(&store.raw(&invite_key("tok1")).unwrap()).unwrap();
        assert_eq!(stored.status, InviteStatus::Active);
    }

    // -- Audit -----------------------------------------------------------

    fn audit_entry() -> SessionAudit {
        SessionAudit {
            session_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            started_at: Utc::now() - ChronoDuration::minutes(30),
            ended_at: Utc::now(),
            end_reason: "timeout".to_string(),
            queue_wait_ms: 1500,
            source_address: "10.0.0.7".to_string(),
            user_agent: Some("test-agent".to_string()),
            errors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_audit_appends_and_marks_used() {
        let store = MemoryStore::new();
        seed(&store, "tok1", &active_record(1)).await;

        let entry = audit_entry();
        let session_id = entry.session_id;
        record_session_audit(&store, "tok1", entry).await;

        let stored: InviteRecord =
            serde_json::from_str(&store.raw(&invite_key("tok1")).unwrap()).unwrap();
        assert_eq!(stored.use_count, 1);
        assert_eq!(stored.status, InviteStatus::Used);
        assert_eq!(stored.sessions.len(), 1);
        assert_eq!(stored.sessions[0].session_id, session_id);
        assert_eq!(stored.sessions[0].end_reason, "timeout");

        // TTL covers expiry plus the audit retention window
        let ttl = store.recorded_ttl(&invite_key("tok1")).unwrap();
        assert!(ttl > 29 * 86_400, "ttl {} should cover retention", ttl);
    }

    #[tokio::test]
    async fn test_audit_below_max_uses_stays_active() {
        let store = MemoryStore::new();
        let mut record = active_record(1);
        record.max_uses = 3;
        seed(&store, "tok1", &record).await;

        record_session_audit(&store, "tok1", audit_entry()).await;

        let stored: InviteRecord =
            serde_json::from_str(&store.raw(&invite_key("tok1")).unwrap()).unwrap();
        assert_eq!(stored.use_count, 1);
        assert_eq!(stored.status, InviteStatus::Active);
    }

    #[tokio::test]
    async fn test_audit_swallows_store_failure() {
        let store = MemoryStore::new();
        store.set_failing(true);

        // Must not panic or propagate
        record_session_audit(&store, "tok1", audit_entry()).await;
    }

    #[test]
    fn test_record_json_field_names_match_store_layout() {
        let record = active_record(1);
        let json = serde_json::to_string(&record).unwrap();

        assert!(json.contains("\"expiresAt\""));
        assert!(json.contains("\"maxUses\""));
        assert!(json.contains("\"useCount\""));
        assert!(json.contains("\"status\":\"active\""));
        assert!(json.contains("\"sessions\":[]"));
    }
}
