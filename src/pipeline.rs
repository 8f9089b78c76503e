//! Admission pipeline: the per-request state machine from wait-queue entry
//! through account failover to post-forward accounting.

mod intercept;

pub use intercept::{detect_intercept, InterceptKind};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::concurrency::{self, ConcurrencyManager, ReleaseHandle, WaitError};
use crate::config::Config;
use crate::entities::{
    Account, AuthContext, BillingError, BillingGate, EntityStore, ForwardError, ForwardRequest,
    Forwarder, Group, Platform, UsageRecord,
};
use crate::scheduler::SessionScheduler;
use crate::selector::{AccountSelector, SelectError, Selection};
use crate::session::{self, ModelFamily, ParsedRequest};
use crate::sse::ReplyChannel;

const USAGE_RECORD_TIMEOUT: Duration = Duration::from_secs(10);

/// Releases its handle when dropped, so every exit path of an admission
/// attempt frees what it acquired; explicit release stays idempotent.
struct Held(ReleaseHandle);

impl Held {
    fn new(handle: ReleaseHandle, cancel: &CancellationToken) -> Self {
        Self(handle.guard_on_cancel(cancel))
    }

    fn release(&self) {
        self.0.release();
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        self.0.release();
    }
}

pub struct AdmissionPipeline {
    concurrency: Arc<ConcurrencyManager>,
    scheduler: SessionScheduler,
    selector: AccountSelector,
    entities: Arc<dyn EntityStore>,
    billing: Arc<dyn BillingGate>,
    forwarder: Arc<dyn Forwarder>,
    config: Arc<Config>,
}

impl AdmissionPipeline {
    pub fn new(
        concurrency: Arc<ConcurrencyManager>,
        scheduler: SessionScheduler,
        selector: AccountSelector,
        entities: Arc<dyn EntityStore>,
        billing: Arc<dyn BillingGate>,
        forwarder: Arc<dyn Forwarder>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            concurrency,
            scheduler,
            selector,
            entities,
            billing,
            forwarder,
            config,
        }
    }

    /// Drive one request through admission. Every outcome, success or error,
    /// is delivered through `reply`.
    pub async fn handle_messages(
        &self,
        auth: AuthContext,
        headers: HeaderMap,
        body: Bytes,
        mut reply: ReplyChannel,
        cancel: CancellationToken,
    ) {
        if body.is_empty() {
            let _ = reply
                .send_error(StatusCode::BAD_REQUEST, "invalid_request_error", "Request body is empty")
                .await;
            return;
        }
        let Some(parsed) = ParsedRequest::parse(&body) else {
            let _ = reply
                .send_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    "Failed to parse request body",
                )
                .await;
            return;
        };
        // Client gating comes before request-shape validation: a rejected
        // client learns nothing about which fields the gateway wanted.
        let is_claude_code = session::is_claude_code_client(&headers, &parsed);
        if self.config.gateway.require_claude_code && !is_claude_code {
            tracing::info!(user_id = auth.user_id, "rejected non-cli client (global setting)");
            let _ = reply
                .send_error(
                    StatusCode::FORBIDDEN,
                    "access_denied",
                    "Only Claude Code clients are allowed. Please use the official Claude Code CLI.",
                )
                .await;
            return;
        }

        if parsed.model.is_empty() {
            let _ = reply
                .send_error(StatusCode::BAD_REQUEST, "invalid_request_error", "model is required")
                .await;
            return;
        }

        // Group model policy: allow-list first, then mapping onto the
        // effective upstream model.
        let group = match self.entities.get_group(auth.group_id).await {
            Ok(group) => group,
            Err(err) => {
                tracing::error!(%err, "group load failed");
                let _ = reply
                    .send_error(StatusCode::SERVICE_UNAVAILABLE, "api_error", "No available accounts")
                    .await;
                return;
            }
        };
        let mut model = parsed.model.clone();
        if let Some(group) = &group {
            if !group.is_model_allowed(&model) {
                let _ = reply
                    .send_error(
                        StatusCode::BAD_REQUEST,
                        "invalid_request_error",
                        &format!("model '{model}' is not allowed in this group"),
                    )
                    .await;
                return;
            }
            let mapped = group.map_model(&model);
            if mapped != model {
                tracing::info!(from = %model, to = %mapped, group_id = auth.group_id, "model mapping applied");
                model = mapped;
            }
        }

        let request_id = concurrency::generate_request_id();

        // [0] Bounded wait queue; full queue rejects before anything waits.
        let max_wait = concurrency::max_wait(auth.concurrency);
        let wait_seat = match self.concurrency.user_wait_seat(auth.user_id, max_wait).await {
            Ok(Some(seat)) => Held::new(seat, &cancel),
            Ok(None) => {
                let _ = reply
                    .send_error(
                        StatusCode::TOO_MANY_REQUESTS,
                        "rate_limit_error",
                        "Too many pending requests, please retry later",
                    )
                    .await;
                return;
            }
            Err(err) => {
                tracing::error!(%err, "wait queue increment failed");
                let _ = reply
                    .send_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "api_error",
                        "Internal error checking wait queue",
                    )
                    .await;
                return;
            }
        };

        // [1] User slot, waiting with backoff and pings.
        let user_slot = match self
            .concurrency
            .user_slot_with_wait(auth.user_id, auth.concurrency, &request_id, &mut reply, &cancel)
            .await
        {
            Ok(handle) => Held::new(handle, &cancel),
            Err(err) => {
                self.concurrency_failure(&mut reply, err, "user").await;
                return;
            }
        };
        // Out of the queue once the slot is held.
        wait_seat.release();

        // [2] Billing recheck: the balance can drain while queued.
        if let Err(err) = self.billing.check_eligibility(&auth).await {
            tracing::info!(user_id = auth.user_id, %err, "billing recheck failed");
            let (status, error_type) = match &err {
                BillingError::Unavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "billing_service_error")
                }
                BillingError::Denied(_) => (StatusCode::FORBIDDEN, "billing_error"),
            };
            let _ = reply.send_error(status, error_type, &err.to_string()).await;
            return;
        }

        let session_hash = parsed.session_hash();
        let session_key = session_key(&group, &session_hash);

        self.failover_loop(
            &auth,
            &group,
            &parsed,
            &model,
            &session_key,
            is_claude_code,
            &request_id,
            &body,
            &mut reply,
            &cancel,
        )
        .await;

        drop(user_slot);
    }

    /// [3]..[12]: select an account, admit against it, forward, and switch
    /// accounts on distinguished upstream failures within the budget.
    #[allow(clippy::too_many_arguments)]
    async fn failover_loop(
        &self,
        auth: &AuthContext,
        group: &Option<Group>,
        parsed: &ParsedRequest,
        model: &str,
        session_key: &str,
        is_claude_code: bool,
        request_id: &str,
        body: &Bytes,
        reply: &mut ReplyChannel,
        cancel: &CancellationToken,
    ) {
        let max_switches = match group.as_ref().map(|group| group.platform) {
            Some(Platform::Gemini) => self.config.gateway.max_account_switches_gemini,
            _ => self.config.gateway.max_account_switches,
        };
        let family = ModelFamily::parse(model);

        let mut failed: HashSet<i64> = HashSet::new();
        let mut switch_count = 0u32;
        let mut last_status = 0u16;

        loop {
            // [3] Pick an account.
            let selection = match self
                .selector
                .select(auth.group_id, session_key, model, &failed, is_claude_code)
                .await
            {
                Ok(selection) => selection,
                Err(SelectError::ClaudeCodeOnly) => {
                    tracing::info!(user_id = auth.user_id, "rejected non-cli client (group restriction)");
                    let _ = reply
                        .send_error(
                            StatusCode::FORBIDDEN,
                            "access_denied",
                            "This group only allows Claude Code clients. Please use the official Claude Code CLI.",
                        )
                        .await;
                    return;
                }
                Err(err) => {
                    if failed.is_empty() {
                        let _ = reply
                            .send_error(
                                StatusCode::SERVICE_UNAVAILABLE,
                                "api_error",
                                &format!("No available accounts: {err}"),
                            )
                            .await;
                    } else {
                        self.failover_exhausted(reply, last_status).await;
                    }
                    return;
                }
            };
            let account = selection.account.clone();
            tracing::debug!(account_id = account.id, model, "account selected");

            // [4] Synthetic responses never reach upstream.
            if account.intercept_warmup {
                if let Some(kind) = detect_intercept(body) {
                    if let Some(release) = &selection.release {
                        release.release();
                    }
                    intercept::send_mock_response(reply, model, kind, parsed.stream).await;
                    return;
                }
            }

            // [5] Session mutex serializes opus/sonnet turns of one session.
            let needs_mutex = account.is_anthropic()
                && !session_key.is_empty()
                && family.map(ModelFamily::uses_session_mutex).unwrap_or(true);
            let mutex = if needs_mutex {
                match self
                    .concurrency
                    .session_mutex_with_wait(account.id, session_key, request_id, reply, cancel)
                    .await
                {
                    Ok(handle) => Some(Held::new(handle, cancel)),
                    Err(err) => {
                        if let Some(release) = &selection.release {
                            release.release();
                        }
                        self.concurrency_failure(reply, err, "session_mutex").await;
                        return;
                    }
                }
            } else {
                None
            };

            // [6] Account/model slot, pre-acquired by the selector or waited
            // for against the selection's plan.
            let (slot, slot_index) = match self
                .admit_on_account(&selection, &account, session_key, family, request_id, reply, cancel)
                .await
            {
                AdmitOutcome::Admitted { slot, slot_index } => (Held::new(slot, cancel), slot_index),
                AdmitOutcome::Failed => return,
            };

            if !selection.acquired && !session_key.is_empty() {
                if let Err(err) = self
                    .entities
                    .bind_sticky_session(auth.group_id, session_key, account.id)
                    .await
                {
                    tracing::warn!(%err, "sticky session bind failed");
                }
            }

            // [7] User-input pacing: real users do not reply instantly.
            if account.is_anthropic() && !parsed.is_tool_result {
                if let Some(index) = slot_index {
                    if let Err(err) = self
                        .concurrency
                        .pace_user_input(account.id, index, &self.config.user_input_pacing, cancel)
                        .await
                    {
                        tracing::debug!(account_id = account.id, %err, "pacing interrupted");
                        return;
                    }
                }
            }

            // [8] RPM gate.
            if account.is_anthropic() {
                if let Err(err) = self
                    .concurrency
                    .wait_for_rpm_slot(account.id, account.max_rpm, reply, cancel)
                    .await
                {
                    tracing::debug!(account_id = account.id, %err, "rpm wait interrupted");
                    return;
                }
            }

            // [9] Forward.
            let request = ForwardRequest {
                body: body.clone(),
                model: model.to_string(),
                stream: parsed.stream,
            };
            let result = self.forwarder.forward(&request, &account, reply).await;

            if account.is_anthropic() {
                if let Some(index) = slot_index {
                    self.concurrency.mark_response_end(account.id, index).await;
                }
            }

            // [11] Free per-attempt resources before accounting or retrying.
            if let Some(mutex) = &mutex {
                mutex.release();
            }
            slot.release();

            match result {
                // [12] Distinguished upstream failure: exclude and retry.
                Err(ForwardError::Failover { status }) => {
                    failed.insert(account.id);
                    last_status = status;
                    if switch_count >= max_switches {
                        self.failover_exhausted(reply, last_status).await;
                        return;
                    }
                    switch_count += 1;
                    tracing::warn!(
                        account_id = account.id,
                        status,
                        switch_count,
                        max_switches,
                        "upstream failure, switching account"
                    );
                    continue;
                }
                Err(ForwardError::Terminal(message)) => {
                    tracing::error!(account_id = account.id, %message, "forward failed");
                    let _ = reply
                        .send_error(StatusCode::BAD_GATEWAY, "upstream_error", "Upstream request failed")
                        .await;
                    return;
                }
                Ok(result) => {
                    // [10] Post-forward accounting and the 30-minute cap.
                    if account.is_anthropic() {
                        self.post_accounting(&account, request_id).await;
                    }
                    self.spawn_usage_record(auth, &account, model, parsed.stream, &result);
                    return;
                }
            }
        }
    }

    async fn admit_on_account(
        &self,
        selection: &Selection,
        account: &Account,
        session_key: &str,
        family: Option<ModelFamily>,
        request_id: &str,
        reply: &mut ReplyChannel,
        cancel: &CancellationToken,
    ) -> AdmitOutcome {
        if selection.acquired {
            let slot = selection.release.clone().unwrap_or_else(ReleaseHandle::noop);
            return AdmitOutcome::Admitted {
                slot,
                slot_index: selection.slot_index,
            };
        }

        let Some(plan) = selection.wait_plan else {
            let _ = reply
                .send_error(StatusCode::SERVICE_UNAVAILABLE, "api_error", "No available accounts")
                .await;
            return AdmitOutcome::Failed;
        };

        // Account-level wait queue is bounded like the user queue.
        let seat = match self.concurrency.account_wait_seat(account.id, plan.max_waiting).await {
            Ok(Some(seat)) => Held::new(seat, cancel),
            Ok(None) => {
                tracing::info!(account_id = account.id, "account wait queue full");
                let _ = reply
                    .send_error(
                        StatusCode::TOO_MANY_REQUESTS,
                        "rate_limit_error",
                        "Too many pending requests, please retry later",
                    )
                    .await;
                return AdmitOutcome::Failed;
            }
            Err(err) => {
                tracing::error!(%err, "account wait queue increment failed");
                let _ = reply
                    .send_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "api_error",
                        "Internal error checking account wait queue",
                    )
                    .await;
                return AdmitOutcome::Failed;
            }
        };

        let outcome = if account.is_anthropic() && !session_key.is_empty() {
            let scheduler = &self.scheduler;
            let max_concurrency = plan.max_concurrency;
            self.concurrency
                .waiter(slot_type_for(family), plan.timeout)
                .run(reply, cancel, || async {
                    let slot = scheduler
                        .acquire_session_slot(account.id, max_concurrency, session_key, family)
                        .await?;
                    if slot.acquired {
                        Ok(Some((
                            slot.slot_index,
                            slot.release.unwrap_or_else(ReleaseHandle::noop),
                        )))
                    } else {
                        Ok(None)
                    }
                })
                .await
        } else {
            self.concurrency
                .account_slot_with_wait(
                    account.id,
                    plan.max_concurrency,
                    plan.timeout,
                    request_id,
                    reply,
                    cancel,
                )
                .await
                .map(|handle| (None, handle))
        };

        match outcome {
            Ok((slot_index, slot)) => {
                seat.release();
                AdmitOutcome::Admitted { slot, slot_index }
            }
            Err(err) => {
                self.concurrency_failure(reply, err, "account").await;
                AdmitOutcome::Failed
            }
        }
    }

    async fn post_accounting(&self, account: &Account, request_id: &str) {
        let outcome = self
            .concurrency
            .record_account_request(account.id, request_id, account.max_30m_requests)
            .await;
        if !outcome.should_pause {
            return;
        }

        let cooldown_minutes = account.rate_limit_cooldown_minutes;
        if let Err(err) = self
            .entities
            .pause_account_for_30m_limit(account.id, cooldown_minutes, outcome.count_30m)
            .await
        {
            tracing::error!(account_id = account.id, %err, "30m pause failed");
            return;
        }
        if cooldown_minutes > 0 {
            self.concurrency
                .set_account_paused(account.id, Duration::from_secs(u64::from(cooldown_minutes) * 60))
                .await;
            tracing::warn!(
                account_id = account.id,
                cooldown_minutes,
                count = outcome.count_30m,
                "account paused after hitting 30m cap"
            );
        } else {
            tracing::warn!(
                account_id = account.id,
                count = outcome.count_30m,
                "30m cap reached but cooldown is zero"
            );
        }
    }

    fn spawn_usage_record(
        &self,
        auth: &AuthContext,
        account: &Account,
        model: &str,
        stream: bool,
        result: &crate::entities::ForwardResult,
    ) {
        let entities = self.entities.clone();
        let usage = UsageRecord {
            api_key_id: auth.api_key_id,
            user_id: auth.user_id,
            account_id: account.id,
            model: model.to_string(),
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            stream,
        };
        tokio::spawn(async move {
            let record = entities.record_usage(usage);
            if let Ok(Err(err)) = tokio::time::timeout(USAGE_RECORD_TIMEOUT, record).await {
                tracing::warn!(%err, "usage record failed");
            }
        });
    }

    /// Concurrency-wait failures surface as 429; cancellations end the
    /// request silently since nobody is listening anymore.
    async fn concurrency_failure(&self, reply: &mut ReplyChannel, err: WaitError, slot_type: &str) {
        if err.is_cancelled() {
            tracing::debug!(slot_type, "request cancelled while waiting");
            return;
        }
        tracing::info!(slot_type, %err, "concurrency acquire failed");
        let _ = reply
            .send_error(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                &format!("Concurrency limit exceeded for {slot_type}, please retry later"),
            )
            .await;
    }

    async fn failover_exhausted(&self, reply: &mut ReplyChannel, last_status: u16) {
        let (status, error_type, message) = map_upstream_error(last_status);
        let _ = reply.send_error(status, error_type, message).await;
    }
}

enum AdmitOutcome {
    Admitted {
        slot: ReleaseHandle,
        slot_index: Option<u32>,
    },
    Failed,
}

fn slot_type_for(family: Option<ModelFamily>) -> &'static str {
    match family {
        Some(family) => family.as_str(),
        None => "account",
    }
}

/// Gemini session keys get a platform prefix so the two wire protocols never
/// collide on one binding.
fn session_key(group: &Option<Group>, session_hash: &str) -> String {
    match group.as_ref().map(|group| group.platform) {
        Some(Platform::Gemini) if !session_hash.is_empty() => format!("gemini:{session_hash}"),
        _ => session_hash.to_string(),
    }
}

/// Translate the last upstream failure of an exhausted failover loop into
/// the user-visible error.
pub fn map_upstream_error(status: u16) -> (StatusCode, &'static str, &'static str) {
    match status {
        401 => (
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "Upstream authentication failed, please contact administrator",
        ),
        403 => (
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "Upstream access forbidden, please contact administrator",
        ),
        429 => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "Upstream rate limit exceeded, please retry later",
        ),
        529 => (
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded_error",
            "Upstream service overloaded, please retry later",
        ),
        500 | 502 | 503 | 504 => (
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "Upstream service temporarily unavailable",
        ),
        _ => (StatusCode::BAD_GATEWAY, "upstream_error", "Upstream request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_mapping_matches_policy() {
        assert_eq!(map_upstream_error(401).0, StatusCode::BAD_GATEWAY);
        assert_eq!(map_upstream_error(403).1, "upstream_error");
        assert_eq!(map_upstream_error(429).0, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(map_upstream_error(429).1, "rate_limit_error");
        assert_eq!(map_upstream_error(529).0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(map_upstream_error(529).1, "overloaded_error");
        for status in [500u16, 502, 503, 504] {
            assert_eq!(map_upstream_error(status).0, StatusCode::BAD_GATEWAY);
        }
        assert_eq!(map_upstream_error(418).2, "Upstream request failed");
    }

    #[test]
    fn gemini_sessions_get_prefixed_keys() {
        let gemini = Some(Group {
            platform: Platform::Gemini,
            ..Group::default()
        });
        assert_eq!(session_key(&gemini, "abc"), "gemini:abc");
        assert_eq!(session_key(&gemini, ""), "");

        let anthropic = Some(Group::default());
        assert_eq!(session_key(&anthropic, "abc"), "abc");
        assert_eq!(session_key(&None, "abc"), "abc");
    }

    #[test]
    fn slot_type_names_follow_family() {
        assert_eq!(slot_type_for(Some(ModelFamily::Opus)), "opus");
        assert_eq!(slot_type_for(Some(ModelFamily::Haiku)), "haiku");
        assert_eq!(slot_type_for(None), "account");
    }
}
