//! Common test utilities
//!
//! In-process fakes for the credential authority and the clock, plus builders
//! for desired state. Every test binary uses a different subset.

#![allow(dead_code, reason = "each test binary uses a different subset of helpers")]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use controller::auth::{AccessToken, StaticTokenResolver};
use controller::authority::{
    AuthorityError, CertificateAuthority, IssueRequest, IssuedCertificate, RevokeRequest,
};
use controller::controller::reconciler::{Reconciler, ReconcilerSettings};
use controller::crd::{CertificateFormat, DesiredCertificate, DestinationRef, PkiSecretSpec};
use controller::destination::MemoryDestinationStore;
use controller::lifecycle::{Clock, ManualClock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use zeroize::Zeroizing;

pub const NAMESPACE: &str = "team-a";
pub const DESTINATION: &str = "web-tls";

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls crypto provider for tests that talk HTTP
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Wall clock that moves with Tokio's (possibly paused) clock
#[derive(Debug)]
pub struct TokioClock {
    wall_origin: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            wall_origin: start_time(),
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.wall_origin + chrono::Duration::from_std(self.origin.elapsed()).unwrap()
    }
}

/// Credential authority that issues numbered serials and records every call
#[derive(Debug)]
pub struct FakeAuthority {
    clock: Arc<dyn Clock>,
    next_serial: AtomicU64,
    issued: Mutex<Vec<IssueRequest>>,
    revoked: Mutex<Vec<RevokeRequest>>,
    issue_failures: Mutex<VecDeque<AuthorityError>>,
    revoke_failures: Mutex<VecDeque<AuthorityError>>,
    /// Issue failures that persist for one common name until lifted
    failing_names: Mutex<HashMap<String, AuthorityError>>,
    hang_revokes: AtomicBool,
}

impl FakeAuthority {
    /// Certificates issued without a TTL live this long
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            next_serial: AtomicU64::new(1),
            issued: Mutex::new(Vec::new()),
            revoked: Mutex::new(Vec::new()),
            issue_failures: Mutex::new(VecDeque::new()),
            revoke_failures: Mutex::new(VecDeque::new()),
            failing_names: Mutex::new(HashMap::new()),
            hang_revokes: AtomicBool::new(false),
        }
    }

    pub fn fail_next_issue(&self, error: AuthorityError) {
        self.issue_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_next_revoke(&self, error: AuthorityError) {
        self.revoke_failures.lock().unwrap().push_back(error);
    }

    /// Every issue for `common_name` fails with `error` until [`Self::recover`]
    pub fn fail_issues_for(&self, common_name: &str, error: AuthorityError) {
        self.failing_names
            .lock()
            .unwrap()
            .insert(common_name.to_string(), error);
    }

    pub fn recover(&self, common_name: &str) {
        self.failing_names.lock().unwrap().remove(common_name);
    }

    /// Revoke calls never answer, as with a stalled endpoint
    pub fn hang_revokes(&self) {
        self.hang_revokes.store(true, Ordering::SeqCst);
    }

    pub fn issued(&self) -> Vec<IssueRequest> {
        self.issued.lock().unwrap().clone()
    }

    pub fn issue_count(&self) -> usize {
        self.issued.lock().unwrap().len()
    }

    pub fn revoked_serials(&self) -> Vec<String> {
        self.revoked
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.serial_number.clone())
            .collect()
    }
}

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    async fn issue(
        &self,
        _token: &AccessToken,
        request: &IssueRequest,
    ) -> Result<IssuedCertificate, AuthorityError> {
        if let Some(error) = self.issue_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.failing_names.lock().unwrap().get(&request.common_name) {
            return Err(error.clone());
        }
        let n = self.next_serial.fetch_add(1, Ordering::SeqCst);
        self.issued.lock().unwrap().push(request.clone());

        let ttl = request.ttl.unwrap_or(Self::DEFAULT_TTL);
        Ok(IssuedCertificate {
            serial_number: serial(n),
            certificate: format!("-----BEGIN CERTIFICATE-----\ncert-{n}\n-----END CERTIFICATE-----"),
            private_key: Zeroizing::new(format!("key-{n}")),
            private_key_type: Some("rsa".to_string()),
            issuing_ca: "ca".to_string(),
            ca_chain: vec!["ca".to_string()],
            not_before: None,
            not_after: self.clock.now() + chrono::Duration::from_std(ttl).unwrap(),
        })
    }

    async fn revoke(
        &self,
        _token: &AccessToken,
        request: &RevokeRequest,
    ) -> Result<(), AuthorityError> {
        if self.hang_revokes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self.revoke_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.revoked.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Serial handed out by the `n`th successful issue
pub fn serial(n: u64) -> String {
    format!("00:00:{n:02x}")
}

/// Spec with a 15s TTL renewed 5s before expiry, writing into [`DESTINATION`]
pub fn spec(common_name: &str) -> PkiSecretSpec {
    PkiSecretSpec {
        auth_ref: Some("vault-token".to_string()),
        namespace: None,
        mount: "pki".to_string(),
        role: "secret".to_string(),
        common_name: common_name.to_string(),
        alt_names: Vec::new(),
        ip_sans: Vec::new(),
        uri_sans: Vec::new(),
        exclude_cn_from_sans: false,
        format: CertificateFormat::Pem,
        revoke: false,
        clear: false,
        expiry_offset: Some("5s".to_string()),
        ttl: Some("15s".to_string()),
        destination: DestinationRef {
            name: DESTINATION.to_string(),
            create: true,
            ..DestinationRef::default()
        },
    }
}

pub fn desired(name: &str, spec: PkiSecretSpec) -> DesiredCertificate {
    let mut desired = DesiredCertificate::new(NAMESPACE, name, spec);
    desired.uid = Some(format!("uid-{name}"));
    desired.generation = Some(1);
    desired
}

/// Same resource after a spec edit
pub fn updated(previous: &DesiredCertificate, spec: PkiSecretSpec) -> DesiredCertificate {
    let mut next = previous.clone();
    next.spec = spec;
    next.generation = previous.generation.map(|g| g + 1);
    next
}

/// Reconciler wired to in-process fakes
pub struct Harness {
    pub authority: Arc<FakeAuthority>,
    pub destinations: MemoryDestinationStore,
    pub clock: Arc<ManualClock>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let authority = Arc::new(FakeAuthority::new(clock.clone()));
        let destinations = MemoryDestinationStore::new();
        let reconciler = reconciler(authority.clone(), destinations.clone(), clock.clone());
        Self {
            authority,
            destinations,
            clock,
            reconciler,
        }
    }

    /// A second reconciler over the same authority and store, as after a restart
    pub fn restarted(&self) -> Reconciler {
        reconciler(
            self.authority.clone(),
            self.destinations.clone(),
            self.clock.clone(),
        )
    }
}

pub fn reconciler(
    authority: Arc<FakeAuthority>,
    destinations: MemoryDestinationStore,
    clock: Arc<dyn Clock>,
) -> Reconciler {
    Reconciler::new(
        authority,
        Arc::new(destinations),
        Arc::new(StaticTokenResolver::new(AccessToken::new("test-token"))),
        clock,
        ReconcilerSettings::default(),
    )
}
