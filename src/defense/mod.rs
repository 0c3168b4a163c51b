//! Per-request client defense.
//!
//! [`ClientDefense::inspect`] runs before the view and may short-circuit it;
//! [`ClientDefense::review`] runs after the view and may replace its response.
//! Every penalty is persisted before the verdict that announces it is
//! returned.

mod detector;
pub mod middleware;

pub use detector::{contains_markup, find_markup, Payload};
pub use middleware::client_defense_middleware;

use std::{sync::Arc, time::Duration};

use axum::http::Method;
use serde::Serialize;
use tables::{audit_entries::AuditAction, blocked_clients::BlockedClient};

use crate::{
    audit::AuditLog,
    blocklist::Blocklist,
    cache::{keys, Cache},
    env::Routes,
    error::{Error, Result},
    parameters::{defaults, ParameterStore},
};

pub const REQUEST_WINDOW: Duration = Duration::from_secs(1);
pub const SEEN_TTL: Duration = Duration::from_secs(5 * 60);
pub const DONATION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Each suspicious post counts as this many failed logins.
pub const SUSPICIOUS_POST_WEIGHT: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
    pub username: Option<String>,
}

impl ClientInfo {
    pub fn new(ip: &str, user_agent: &str) -> Self {
        Self {
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            username: None,
        }
    }

    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub client: ClientInfo,
    pub method: Method,
    pub path: String,
    pub payload: Payload,
}

/// Human-readable message carried to the next page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    BlockWarning,
    DonationLimit,
    MemberFormLimit,
    MemberFormClosed,
    TimeOut,
    SomethingWrong,
}

impl Notice {
    pub fn message(&self) -> &'static str {
        match self {
            Notice::BlockWarning => {
                "WARNING!! The system logged you out for spamming, next time you will be blocked"
            }
            Notice::DonationLimit => "You reached today's donation limit, please try again tomorrow",
            Notice::MemberFormLimit => "This device already submitted a membership form",
            Notice::MemberFormClosed => "Membership registration is closed at the moment",
            Notice::TimeOut => "Your session timed out, please log in again",
            Notice::SomethingWrong => "Ops!! something went wrong...",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Redirect { to: String, notice: Option<Notice> },
    Forbidden,
}

impl Verdict {
    fn redirect(to: &str) -> Self {
        Verdict::Redirect {
            to: to.to_string(),
            notice: None,
        }
    }

    fn redirect_with(to: &str, notice: Notice) -> Self {
        Verdict::Redirect {
            to: to.to_string(),
            notice: Some(notice),
        }
    }
}

/// What a login form should tell the user after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginFeedback {
    pub failed: u64,
    pub remaining: u64,
    pub warn: bool,
}

#[derive(Clone)]
pub struct ClientDefense {
    cache: Arc<dyn Cache>,
    parameters: ParameterStore,
    audit: AuditLog,
    blocklist: Blocklist,
    routes: Routes,
}

impl ClientDefense {
    pub fn new(
        cache: Arc<dyn Cache>,
        parameters: ParameterStore,
        audit: AuditLog,
        blocklist: Blocklist,
        routes: Routes,
    ) -> Self {
        Self {
            cache,
            parameters,
            audit,
            blocklist,
            routes,
        }
    }

    async fn record(&self, client: &ClientInfo, action: AuditAction) -> Result<u64> {
        self.audit
            .record(
                &client.ip,
                &client.user_agent,
                action,
                client.username.as_deref(),
            )
            .await
    }

    /// Records the offense and escalates the block on a task of its own: a
    /// request dropped mid-way (timeout, client gone) cannot leave the audit
    /// entry without its block.
    async fn penalize(
        &self,
        client: &ClientInfo,
        action: AuditAction,
        indefinitely: bool,
    ) -> Result<BlockedClient> {
        let defense = self.clone();
        let client = client.clone();
        tokio::spawn(async move {
            defense.record(&client, action).await?;
            defense
                .blocklist
                .escalate(&client.ip, &client.user_agent, indefinitely)
                .await
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))?
    }

    /// Pre-dispatch checks, in order. The first one with something to say
    /// decides the verdict.
    pub async fn inspect(&self, request: &RequestDescriptor) -> Result<Verdict> {
        let client = &request.client;

        if let Payload::Malformed(reason) = &request.payload {
            tracing::warn!(kind = "defense", ip = client.ip, reason = reason, "Malformed payload");
            self.penalize(client, AuditAction::AttackAttempt, true).await?;
            return Ok(Verdict::redirect(&self.routes.logout));
        }

        self.count_request(client).await?;
        self.detect_first_visit(client).await?;

        let is_post = request.method == Method::POST;
        if is_post {
            if let Some(verdict) = self.post_throttles(request).await? {
                return Ok(verdict);
            }
            if let Some(verdict) = self.scan_markup(request).await? {
                return Ok(verdict);
            }
            self.record(client, AuditAction::NormalPost).await?;
            if let Some(verdict) = self.post_burst(request).await? {
                return Ok(verdict);
            }
        }

        if let Some(verdict) = self.block_gate(client, &request.path).await? {
            return Ok(verdict);
        }

        if is_post && request.path == self.routes.member_form {
            if let Some(verdict) = self.accept_member_form(request).await? {
                return Ok(verdict);
            }
        }

        Ok(Verdict::Continue)
    }

    /// Post-dispatch review of the evidence gathered so far.
    pub async fn review(&self, client: &ClientInfo, path: &str) -> Result<Verdict> {
        if let Some(verdict) = self.block_gate(client, path).await? {
            return Ok(verdict);
        }

        let failed = self.audit.recent_count(&client.ip, AuditAction::LoggedFailed).await?;
        let suspicious = self
            .audit
            .recent_count(&client.ip, AuditAction::SuspiciousPost)
            .await?;
        let evidence = failed + suspicious * SUSPICIOUS_POST_WEIGHT;
        if evidence == 0 {
            return Ok(Verdict::Continue);
        }

        let allowed = self.parameters.get_u64(defaults::ALLOWED_LOGGED_IN_ATTEMPTS).await?;
        let blocked_times = self
            .blocklist
            .status(&client.ip)
            .await?
            .map(|c| c.blocked_times)
            .unwrap_or(0);
        let threshold = allowed * (blocked_times + 1);

        if evidence >= threshold {
            tracing::warn!(
                kind = "defense",
                ip = client.ip,
                failed = failed,
                suspicious = suspicious,
                threshold = threshold,
                "Failed login threshold reached"
            );
            self.blocklist.escalate(&client.ip, &client.user_agent, false).await?;
            return Ok(Verdict::redirect(path));
        }

        Ok(Verdict::Continue)
    }

    async fn count_request(&self, client: &ClientInfo) -> Result<()> {
        let count = self.cache.incr(&keys::requests(&client.ip), REQUEST_WINDOW).await?;
        let limit = self
            .parameters
            .get_i64(defaults::REQUEST_MAX_LIMIT_PER_SECOND)
            .await?;

        // Escalate once per window, on the first request over the limit.
        if count == limit + 1 {
            tracing::warn!(kind = "defense", ip = client.ip, count = count, "Request rate exceeded");
            self.blocklist.escalate(&client.ip, &client.user_agent, false).await?;
        }
        Ok(())
    }

    async fn detect_first_visit(&self, client: &ClientInfo) -> Result<()> {
        let unseen = self
            .cache
            .add(&keys::seen(&client.ip), "1", Some(SEEN_TTL))
            .await?;
        if unseen && !self.audit.has_any(&client.ip).await? {
            tracing::info!(kind = "defense", ip = client.ip, "First visit");
            self.record(client, AuditAction::FirstVisit).await?;
        }
        Ok(())
    }

    async fn post_throttles(&self, request: &RequestDescriptor) -> Result<Option<Verdict>> {
        let ip = &request.client.ip;

        if request.path == self.routes.donation {
            let count = self.cache.incr(&keys::donations(ip), DONATION_WINDOW).await?;
            let limit = self.parameters.get_i64(defaults::DONATION_POST_LIMIT).await?;
            if count > limit {
                tracing::info!(kind = "defense", ip = ip, count = count, "Donation limit reached");
                return Ok(Some(Verdict::redirect_with(&request.path, Notice::DonationLimit)));
            }
        }

        if request.path == self.routes.member_form {
            if !self
                .parameters
                .get_bool(defaults::OPEN_MEMBER_REGISTRATION_FORM)
                .await?
            {
                return Ok(Some(Verdict::redirect_with(
                    &self.routes.index,
                    Notice::MemberFormClosed,
                )));
            }

            // Only read here; the counter moves when a post is accepted.
            let count = self
                .cache
                .get(&keys::member_forms(ip))
                .await?
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0);
            let limit = self.parameters.get_i64(defaults::MEMBER_FORM_POST_LIMIT).await?;
            if count >= limit {
                tracing::info!(kind = "defense", ip = ip, count = count, "Member form limit reached");
                return Ok(Some(Verdict::redirect_with(&request.path, Notice::MemberFormLimit)));
            }
        }

        Ok(None)
    }

    /// Counts an accepted member-form post against the cap. A concurrent post
    /// that got there first turns this one away.
    async fn accept_member_form(&self, request: &RequestDescriptor) -> Result<Option<Verdict>> {
        let client = &request.client;
        let reset_days = self
            .parameters
            .get_u64(defaults::ALLOWED_LOGGED_IN_ATTEMPTS_RESET)
            .await?;
        let window = Duration::from_secs(reset_days.max(1) * 24 * 60 * 60);
        let count = self.cache.incr(&keys::member_forms(&client.ip), window).await?;
        let limit = self.parameters.get_i64(defaults::MEMBER_FORM_POST_LIMIT).await?;
        if count > limit {
            tracing::info!(kind = "defense", ip = client.ip, count = count, "Member form limit reached");
            return Ok(Some(Verdict::redirect_with(&request.path, Notice::MemberFormLimit)));
        }

        self.record(client, AuditAction::MemberFormPost).await?;
        Ok(None)
    }

    async fn scan_markup(&self, request: &RequestDescriptor) -> Result<Option<Verdict>> {
        let client = &request.client;
        let Some(field) = find_markup(request.payload.fields()) else {
            return Ok(None);
        };

        tracing::warn!(
            kind = "defense",
            ip = client.ip,
            username = client.username,
            user_agent = client.user_agent,
            field = field,
            "Attack attempt detected"
        );
        self.penalize(client, AuditAction::AttackAttempt, true).await?;
        Ok(Some(Verdict::redirect(&self.routes.logout)))
    }

    async fn post_burst(&self, request: &RequestDescriptor) -> Result<Option<Verdict>> {
        let client = &request.client;
        let window_ms = self
            .parameters
            .get_u64(defaults::BETWEEN_POST_REQUESTS_TIME)
            .await?;
        let count = self
            .cache
            .incr(&keys::posts(&client.ip), Duration::from_millis(window_ms.max(1)))
            .await?;

        let verdict = match count {
            i64::MIN..=1 => return Ok(None),
            2..=3 => {
                tracing::warn!(kind = "defense", ip = client.ip, count = count, "Rapid posts cut");
                Verdict::redirect_with(&self.routes.logout, Notice::BlockWarning)
            }
            4..=5 => {
                tracing::warn!(kind = "defense", ip = client.ip, count = count, "Suspicious posts");
                self.penalize(client, AuditAction::SuspiciousPost, false).await?;
                Verdict::redirect(&request.path)
            }
            _ => {
                tracing::warn!(kind = "defense", ip = client.ip, count = count, "Post flood");
                self.penalize(client, AuditAction::SuspiciousPost, true).await?;
                Verdict::redirect(&request.path)
            }
        };
        Ok(Some(verdict))
    }

    /// Blocked clients get a fresh attempt once a temporary block runs out,
    /// and a 403 otherwise.
    async fn block_gate(&self, client: &ClientInfo, path: &str) -> Result<Option<Verdict>> {
        if self.blocklist.check(&client.ip).await?.is_none() {
            return Ok(None);
        }
        if self.blocklist.unblock_if_expired(&client.ip).await? {
            return Ok(Some(Verdict::redirect(path)));
        }
        tracing::warn!(kind = "defense", ip = client.ip, path = path, "Blocked client refused");
        Ok(Some(Verdict::Forbidden))
    }

    /// Read-only block query for other subsystems.
    pub async fn is_blocked(&self, ip: &str) -> Result<bool> {
        self.blocklist.is_blocked(ip).await
    }

    /// Called by the authentication flow. Failures are only recorded here;
    /// the penalty is applied by [`ClientDefense::review`] once enough
    /// evidence has accumulated.
    pub async fn record_login_result(
        &self,
        client: &ClientInfo,
        username: &str,
        success: bool,
    ) -> Result<LoginFeedback> {
        let client = client.clone().with_username(Some(username.to_string()));
        let allowed = self.parameters.get_u64(defaults::ALLOWED_LOGGED_IN_ATTEMPTS).await?;

        if success {
            self.record(&client, AuditAction::LoggedIn).await?;
            tracing::info!(kind = "auth", ip = client.ip, username = username, "Login");
            return Ok(LoginFeedback {
                failed: 0,
                remaining: allowed,
                warn: false,
            });
        }

        self.record(&client, AuditAction::LoggedFailed).await?;
        tracing::warn!(kind = "auth", ip = client.ip, username = username, "Failed login");

        let failed = self
            .audit
            .recent_count(&client.ip, AuditAction::LoggedFailed)
            .await?;
        let remaining = allowed.saturating_sub(failed);
        // Inverse scaling: the threshold shrinks as failures grow.
        let warn_threshold = allowed / failed.max(1);

        Ok(LoginFeedback {
            failed,
            remaining,
            warn: remaining <= warn_threshold,
        })
    }

    pub async fn record_logout(&self, client: &ClientInfo, username: &str) -> Result<()> {
        let client = client.clone().with_username(Some(username.to_string()));
        self.record(&client, AuditAction::LoggedOut).await?;
        tracing::info!(kind = "auth", ip = client.ip, username = username, "Logout");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::Environment, state::AppState};
    use tables::{
        audit_entries::{AuditEntry, AuditFilter},
        blocked_clients::BlockType,
    };
    use tracing_test::traced_test;

    async fn state() -> AppState {
        AppState::in_memory(Environment::default()).await.unwrap()
    }

    fn post(ip: &str, path: &str, payload: Payload) -> RequestDescriptor {
        RequestDescriptor {
            client: ClientInfo::new(ip, "ua"),
            method: Method::POST,
            path: path.to_string(),
            payload,
        }
    }

    async fn count(state: &AppState, ip: &str, action: AuditAction) -> u64 {
        let conn = state.database.conn().unwrap();
        AuditEntry::count(&conn, &AuditFilter::default().ip(ip).action(action))
            .await
            .unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn dropped_request_still_blocks_what_it_recorded() {
        // arrange
        let state = state().await;
        let request = post("3.3.3.3", "/donate", Payload::Malformed("junk".to_string()));

        // act
        let res = tokio::time::timeout(Duration::ZERO, state.defense.inspect(&request)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // assert
        assert!(res.is_err());
        assert_eq!(count(&state, "3.3.3.3", AuditAction::AttackAttempt).await, 1);
        let blocked = state.blocklist.status("3.3.3.3").await.unwrap().unwrap();
        assert_eq!(blocked.block_type, BlockType::Indefinite);
    }

    #[tokio::test]
    #[traced_test]
    async fn refused_member_posts_keep_the_allowance() {
        // arrange
        let state = state().await;
        state
            .parameters
            .set(defaults::BETWEEN_POST_REQUESTS_TIME, "1")
            .await
            .unwrap();
        state.blocklist.escalate("3.3.3.4", "ua", false).await.unwrap();
        let form = || {
            post(
                "3.3.3.4",
                "/member/form",
                Payload::Fields(vec![("name".to_string(), "Sam".to_string())]),
            )
        };

        // act
        let refused = state.defense.inspect(&form()).await.unwrap();
        state.blocklist.unblock("3.3.3.4").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let accepted = state.defense.inspect(&form()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let capped = state.defense.inspect(&form()).await.unwrap();

        // assert
        assert_eq!(refused, Verdict::Forbidden);
        assert_eq!(accepted, Verdict::Continue);
        assert_eq!(
            capped,
            Verdict::redirect_with("/member/form", Notice::MemberFormLimit)
        );
        assert_eq!(count(&state, "3.3.3.4", AuditAction::MemberFormPost).await, 1);
    }
}
