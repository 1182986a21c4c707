//! Per-request access decision.
//!
//! [`RequestGate`] evaluates a fixed, ordered rule list against the request
//! path, the caller's credentials, the cached site-mode settings and (only
//! when a rule needs it) the caller's role.  Collaborator failures are
//! converted where they happen: settings fall back to "no restrictions",
//! sessions to anonymous, and roles to "not admin".

pub mod cache;
pub mod clock;
pub mod middleware;
pub mod pass;
pub mod paths;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::http::{HeaderMap, HeaderName};
use tracing::warn;

use crate::backend::{AuthResolver, RequestCredentials, RoleStore, Session, SettingsStore};
use crate::config::Config;
use crate::metrics::{BackendCall, DecisionLabels, Metrics, Outcome};

use self::cache::{SettingsCache, SiteModeSnapshot};
use self::clock::Clock;
use self::pass::{GatePass, PassKey};
use self::paths::PathRules;

// ---------------------------------------------------------------------------
// Decision types
// ---------------------------------------------------------------------------

/// How the response of a proceeding request is treated on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHeaders {
    Passthrough,
    /// Strip everything not on the configured allowlist.
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed {
        session: Session,
        headers: ResponseHeaders,
    },
    /// 303 to the given path.
    Redirect(String),
}

/// The rule that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Bypass,
    GateRequired,
    GateDisabled,
    Maintenance,
    MaintenanceDisabled,
    HomeRedirect,
    Public,
    LoginRequired,
    AdminDenied,
    Protected,
}

impl Rule {
    pub fn as_str(self) -> &'static str {
        match self {
            Rule::Bypass => "bypass",
            Rule::GateRequired => "gate_required",
            Rule::GateDisabled => "gate_disabled",
            Rule::Maintenance => "maintenance",
            Rule::MaintenanceDisabled => "maintenance_disabled",
            Rule::HomeRedirect => "home_redirect",
            Rule::Public => "public",
            Rule::LoginRequired => "login_required",
            Rule::AdminDenied => "admin_denied",
            Rule::Protected => "protected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub rule: Rule,
}

impl Verdict {
    fn proceed(rule: Rule, session: Session, headers: ResponseHeaders) -> Self {
        Self {
            decision: Decision::Proceed { session, headers },
            rule,
        }
    }

    fn redirect(rule: Rule, to: &str) -> Self {
        Self {
            decision: Decision::Redirect(to.to_string()),
            rule,
        }
    }
}

// ---------------------------------------------------------------------------
// RequestGate
// ---------------------------------------------------------------------------

/// Backend collaborators consumed by the gate.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthResolver>,
    pub settings: Arc<dyn SettingsStore>,
    pub roles: Arc<dyn RoleStore>,
}

pub struct RequestGate {
    paths: PathRules,
    cache: SettingsCache,
    auth: Arc<dyn AuthResolver>,
    roles: Arc<dyn RoleStore>,
    pass_key: PassKey,
    pass_cookie: String,
    admin_role: String,
    timeout: Duration,
    header_allowlist: Vec<HeaderName>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl RequestGate {
    pub fn new(
        config: &Config,
        collaborators: Collaborators,
        pass_key: PassKey,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let timeout = Duration::from_millis(config.backend.timeout_ms);
        let cache = SettingsCache::new(
            collaborators.settings,
            config.settings.clone(),
            Duration::from_secs(config.cache.ttl_secs),
            timeout,
            Arc::clone(&metrics),
        );
        let header_allowlist = config
            .response
            .header_allowlist
            .iter()
            .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok())
            .collect();

        Self {
            paths: PathRules::from_config(&config.paths),
            cache,
            auth: collaborators.auth,
            roles: collaborators.roles,
            pass_key,
            pass_cookie: config.gate.cookie_name.clone(),
            admin_role: config.admin_role.clone(),
            timeout,
            header_allowlist,
            clock,
            metrics,
        }
    }

    pub fn paths(&self) -> &PathRules {
        &self.paths
    }

    pub fn pass_cookie(&self) -> &str {
        &self.pass_cookie
    }

    /// Last settings snapshot, without refreshing.
    pub fn settings_snapshot(&self) -> SiteModeSnapshot {
        self.cache.get()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Issue a pass valid for `ttl` from now.
    pub fn issue_pass(&self, ttl: Duration) -> Result<GatePass> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.pass_key.issue(self.clock.now_ms(), ttl_ms)
    }

    /// Decide what happens to a request for `path`.
    pub async fn evaluate(&self, path: &str, credentials: &RequestCredentials) -> Verdict {
        let started = Instant::now();
        let verdict = self.decide(path, credentials).await;

        let outcome = match verdict.decision {
            Decision::Proceed { .. } => Outcome::Proceed,
            Decision::Redirect(_) => Outcome::Redirect,
        };
        self.metrics
            .decisions_total
            .get_or_create(&DecisionLabels {
                rule: verdict.rule.as_str().to_string(),
                outcome,
            })
            .inc();
        self.metrics
            .decision_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        verdict
    }

    async fn decide(&self, path: &str, credentials: &RequestCredentials) -> Verdict {
        let paths = &self.paths;

        if paths.is_bypass(path) {
            let session = self.resolve_session(credentials).await;
            return Verdict::proceed(Rule::Bypass, session, ResponseHeaders::Passthrough);
        }

        let now = self.clock.now_ms();
        let settings = self.cache.refresh_if_stale(now).await;

        // Gate first: no session needed to bounce anonymous probes.
        let on_gate_page = paths.is_gate_page(path);
        if settings.gate_enabled
            && !on_gate_page
            && !self
                .pass_key
                .is_valid(credentials.cookie(&self.pass_cookie), now)
        {
            return Verdict::redirect(Rule::GateRequired, paths.gate());
        }
        if on_gate_page && !settings.gate_enabled {
            return Verdict::redirect(Rule::GateDisabled, paths.root());
        }

        let session = self.resolve_session(credentials).await;
        let mut admin = None;

        let on_maintenance_page = paths.is_maintenance_page(path);
        if settings.maintenance_enabled
            && !on_maintenance_page
            && !on_gate_page
            && !self.is_admin(&session, &mut admin).await
        {
            return Verdict::redirect(Rule::Maintenance, paths.maintenance());
        }
        if on_maintenance_page && !settings.maintenance_enabled {
            let to = if session.is_authenticated() {
                paths.home()
            } else {
                paths.root()
            };
            return Verdict::redirect(Rule::MaintenanceDisabled, to);
        }

        if paths.is_public(path) {
            if session.is_authenticated() && paths.is_root(path) {
                return Verdict::redirect(Rule::HomeRedirect, paths.home());
            }
            return Verdict::proceed(Rule::Public, session, ResponseHeaders::Passthrough);
        }

        if !session.is_authenticated() {
            return Verdict::redirect(Rule::LoginRequired, paths.root());
        }

        if paths.is_admin_area(path) && !self.is_admin(&session, &mut admin).await {
            return Verdict::redirect(Rule::AdminDenied, paths.home());
        }

        Verdict::proceed(Rule::Protected, session, ResponseHeaders::Filtered)
    }

    /// Drop every header not on the allowlist.
    pub fn filter_response_headers(&self, headers: &mut HeaderMap) {
        let mut kept = HeaderMap::new();
        for name in &self.header_allowlist {
            for value in headers.get_all(name) {
                kept.append(name.clone(), value.clone());
            }
        }
        *headers = kept;
    }

    // -- collaborator calls ------------------------------------------------

    async fn resolve_session(&self, credentials: &RequestCredentials) -> Session {
        match tokio::time::timeout(self.timeout, self.auth.resolve(credentials)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(error = %e, "session resolution failed, treating caller as anonymous");
                self.metrics.backend_failure(BackendCall::Auth);
                Session::anonymous()
            }
            Err(_) => {
                warn!("session resolution timed out, treating caller as anonymous");
                self.metrics.backend_failure(BackendCall::Auth);
                Session::anonymous()
            }
        }
    }

    /// Role check, looked up at most once per request via `memo`.
    async fn is_admin(&self, session: &Session, memo: &mut Option<bool>) -> bool {
        if let Some(known) = *memo {
            return known;
        }
        let Some(user_id) = session.user_id.as_deref() else {
            return false;
        };

        let admin = match tokio::time::timeout(self.timeout, self.roles.get_role(user_id)).await {
            Ok(Ok(role)) => role.as_deref() == Some(self.admin_role.as_str()),
            Ok(Err(e)) => {
                warn!(error = %e, user_id, "role lookup failed, treating caller as non-admin");
                self.metrics.backend_failure(BackendCall::Role);
                false
            }
            Err(_) => {
                warn!(user_id, "role lookup timed out, treating caller as non-admin");
                self.metrics.backend_failure(BackendCall::Role);
                false
            }
        };
        *memo = Some(admin);
        admin
    }
}
