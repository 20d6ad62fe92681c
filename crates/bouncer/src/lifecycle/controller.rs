//! Join lifecycle controller.
//!
//! Per user: `NONE -> CHALLENGED -> {APPROVED | DECLINED}`. A challenge is
//! resolved by exactly one of a correct answer, a wrong answer, or the
//! timeout. Whichever trigger wins the fenced `remove_pending` owns the
//! resolution; the others observe a missing or mismatched entry and no-op.
//!
//! Every public handler catches its own failures, logs them, and sends the
//! generic internal-error message. Nothing propagates into the poll loop.

use std::sync::Arc;
use std::time::Duration;

use bouncer_common::constants::{REASON_TIMED_OUT, REASON_VERIFICATION_ERROR};
use bouncer_common::{
    BouncerError, ChatId, JoinAttempt, JoinRequest, MemberRole, PendingChallenge, UserId,
    Verdict, VerificationRecord,
};
use chrono::{DateTime, Utc};

use super::scheduler::{TimeoutJob, TimeoutScheduler};
use crate::challenge::ChallengeGenerator;
use crate::challenge::templates::render;
use crate::config::BotMessages;
use crate::notify::Notifier;
use crate::storage::{StorageError, Store};
use crate::telegram::ChatPlatform;

/// Timing and wording of the lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub messages: BotMessages,
    pub answer_timeout: Duration,
    pub retry_timeout: Duration,
}

/// Outcome of a startup sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Already expired; resolved as timed out
    pub expired: usize,
    /// Still open; timeout scheduled for the remaining window
    pub rescheduled: usize,
}

pub struct Controller {
    store: Arc<dyn Store>,
    generator: ChallengeGenerator,
    platform: Arc<dyn ChatPlatform>,
    notifier: Notifier,
    scheduler: Arc<dyn TimeoutScheduler>,
    settings: LifecycleSettings,
}

impl Controller {
    pub fn new(
        store: Arc<dyn Store>,
        generator: ChallengeGenerator,
        platform: Arc<dyn ChatPlatform>,
        scheduler: Arc<dyn TimeoutScheduler>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            generator,
            notifier: Notifier::new(platform.clone()),
            platform,
            scheduler,
            settings,
        }
    }

    fn messages(&self) -> &BotMessages {
        &self.settings.messages
    }

    fn retry_secs(&self) -> u64 {
        self.settings.retry_timeout.as_secs()
    }

    /// A user asked to join a group
    pub async fn handle_join_request(&self, request: &JoinRequest, now: DateTime<Utc>) {
        if let Err(e) = self.process_join_request(request, now).await {
            tracing::error!(
                user_id = %request.user_id,
                chat_id = %request.chat_id,
                error = %e,
                retryable = e.is_retryable(),
                "Join request handling failed"
            );
            self.notify_user(request.user_id, &self.messages().internal_error)
                .await;
        }
    }

    async fn process_join_request(
        &self,
        request: &JoinRequest,
        now: DateTime<Utc>,
    ) -> Result<(), BouncerError> {
        let (chat_id, user_id) = (request.chat_id, request.user_id);

        if !self.store.is_group_allowed(chat_id).await? {
            tracing::warn!(chat_id = %chat_id, user_id = %user_id, "Join request for a group that is not allowed");
            return Ok(());
        }

        if self.store.get_pending(user_id).await?.is_some() {
            tracing::info!(user_id = %user_id, "User already has an ongoing challenge");
            self.notify_user(user_id, &self.messages().ongoing_challenge)
                .await;
            return Ok(());
        }

        if let Some(remaining) = self.cooldown_remaining(user_id, now).await? {
            tracing::info!(user_id = %user_id, remaining_secs = remaining, "Join request within retry cooldown");
            self.decline(chat_id, user_id).await;
            let text = render(&self.messages().retry_timer, &[&remaining]);
            self.notify_user(user_id, &text).await;
            return Ok(());
        }

        let Some(topic) = self.store.get_group_topic(chat_id).await? else {
            tracing::error!(chat_id = %chat_id, "Group has no topic set, ignoring join request");
            return Ok(());
        };

        let challenge = self.generator.generate_challenge(&topic).await?;

        let pending = PendingChallenge {
            user_id,
            chat_id,
            chat_title: request.chat_title.clone(),
            display_name: request.display_name.clone(),
            issued_at_ms: now.timestamp_millis(),
            challenge,
        };

        match self.store.insert_pending(&pending).await {
            Ok(()) => {}
            Err(StorageError::DuplicatePending(_)) => {
                tracing::info!(user_id = %user_id, "Concurrent join request already issued a challenge");
                self.notify_user(user_id, &self.messages().ongoing_challenge)
                    .await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.issue(&pending, now).await {
            self.rollback(&pending).await;
            return Err(e);
        }

        tracing::info!(
            user_id = %user_id,
            chat_id = %chat_id,
            issued_at_ms = pending.issued_at_ms,
            "Challenge issued"
        );
        Ok(())
    }

    /// Seconds left in the user's retry cooldown, if any
    async fn cooldown_remaining(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, BouncerError> {
        let Some(last) = self.store.last_join_attempt(user_id).await? else {
            return Ok(None);
        };

        let retry = self.retry_secs() as i64;
        let elapsed = (now.timestamp() - last).max(0);
        if elapsed < retry {
            Ok(Some((retry - elapsed) as u64))
        } else {
            Ok(None)
        }
    }

    /// Steps after the pending entry is stored
    async fn issue(&self, pending: &PendingChallenge, now: DateTime<Utc>) -> Result<(), BouncerError> {
        let text = render(
            &self.messages().join_requested,
            &[
                &pending.display_name,
                &pending.chat_title,
                &pending.challenge,
                &self.settings.answer_timeout.as_secs(),
            ],
        );
        self.notify_user(pending.user_id, &text).await;

        self.store
            .record_join_attempt(&JoinAttempt {
                timestamp: now.timestamp(),
                user_id: pending.user_id,
                display_name: pending.display_name.clone(),
            })
            .await?;

        self.scheduler
            .schedule(TimeoutJob::for_pending(pending), self.settings.answer_timeout);
        Ok(())
    }

    /// Remove a half-issued challenge so no entry outlives its timeout
    async fn rollback(&self, pending: &PendingChallenge) {
        match self
            .store
            .remove_pending(pending.user_id, pending.issued_at_ms)
            .await
        {
            Ok(_) => tracing::debug!(user_id = %pending.user_id, "Pending challenge rolled back"),
            Err(e) => tracing::error!(
                user_id = %pending.user_id,
                error = %e,
                "Failed to roll back pending challenge"
            ),
        }
    }

    /// The answer window of a challenge elapsed
    pub async fn handle_timeout(&self, job: &TimeoutJob, now: DateTime<Utc>) {
        if let Err(e) = self.process_timeout(job, now).await {
            tracing::error!(user_id = %job.user_id, error = %e, "Timeout handling failed");
            self.notify_user(job.user_id, &self.messages().internal_error)
                .await;
        }
    }

    async fn process_timeout(&self, job: &TimeoutJob, now: DateTime<Utc>) -> Result<(), BouncerError> {
        let pending = match self.store.get_pending(job.user_id).await? {
            Some(p) if p.issued_at_ms == job.issued_at_ms => p,
            _ => {
                tracing::debug!(user_id = %job.user_id, issued_at_ms = job.issued_at_ms, "Stale timeout ignored");
                return Ok(());
            }
        };

        if !self
            .store
            .remove_pending(job.user_id, job.issued_at_ms)
            .await?
        {
            tracing::debug!(user_id = %job.user_id, "Challenge resolved before timeout");
            return Ok(());
        }

        tracing::warn!(
            user_id = %job.user_id,
            display_name = %job.display_name,
            chat_id = %job.chat_id,
            "Challenge timed out"
        );
        self.resolve_timed_out(&pending, now).await;
        Ok(())
    }

    /// Decline, notify and audit a challenge whose entry this caller removed
    async fn resolve_timed_out(&self, pending: &PendingChallenge, now: DateTime<Utc>) {
        self.audit(VerificationRecord::resolve(
            pending,
            "",
            Verdict::Declined,
            REASON_TIMED_OUT,
            now,
        ))
        .await;
        self.decline(pending.chat_id, pending.user_id).await;

        let text = render(&self.messages().timed_out, &[&self.retry_secs()]);
        self.notify_user(pending.user_id, &text).await;
    }

    /// A user sent text in their private chat with the bot.
    /// `chat_title` names the chat the answer arrived in and is only logged.
    pub async fn handle_answer(
        &self,
        user_id: UserId,
        display_name: &str,
        chat_title: &str,
        answer: &str,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self.process_answer(user_id, display_name, chat_title, answer, now).await {
            tracing::error!(user_id = %user_id, error = %e, "Answer handling failed");
            self.notify_user(user_id, &self.messages().internal_error)
                .await;
        }
    }

    async fn process_answer(
        &self,
        user_id: UserId,
        display_name: &str,
        chat_title: &str,
        answer: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BouncerError> {
        let Some(pending) = self.store.get_pending(user_id).await? else {
            tracing::debug!(user_id = %user_id, "Message from user without a challenge");
            self.notify_user(user_id, &self.messages().no_challenge).await;
            return Ok(());
        };

        // Claim the entry before the slow verifier call
        if !self
            .store
            .remove_pending(user_id, pending.issued_at_ms)
            .await?
        {
            tracing::debug!(user_id = %user_id, "Challenge already resolved concurrently");
            return Ok(());
        }
        self.scheduler.cancel(user_id, pending.issued_at_ms);

        if pending.is_expired(now, self.settings.answer_timeout) {
            tracing::warn!(user_id = %user_id, display_name = %display_name, "Answer arrived after the window closed");
            self.decline(pending.chat_id, user_id).await;
            self.notify_user(user_id, &self.messages().no_challenge).await;
            return Ok(());
        }

        let verification = match self.generator.verify_answer(&pending.challenge, answer).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Answer verification failed");
                self.decline(pending.chat_id, user_id).await;
                self.notify_user(user_id, &self.messages().internal_error)
                    .await;
                self.audit(VerificationRecord::resolve(
                    &pending,
                    answer,
                    Verdict::Declined,
                    REASON_VERIFICATION_ERROR,
                    now,
                ))
                .await;
                return Ok(());
            }
        };

        if verification.passed {
            tracing::info!(
                user_id = %user_id,
                display_name = %display_name,
                chat_id = %pending.chat_id,
                answer_chat = %chat_title,
                "Correct answer, approving"
            );
            self.approve(pending.chat_id, user_id).await;
            self.notify_user(user_id, &self.messages().correct_answer)
                .await;
            self.audit(VerificationRecord::resolve(
                &pending,
                answer,
                Verdict::Accepted,
                "",
                now,
            ))
            .await;
        } else {
            tracing::warn!(
                user_id = %user_id,
                display_name = %display_name,
                chat_id = %pending.chat_id,
                reason = %verification.reason,
                "Wrong answer, declining"
            );
            self.decline(pending.chat_id, user_id).await;
            let text = render(&self.messages().wrong_answer, &[&self.retry_secs()]);
            self.notify_user(user_id, &text).await;
            self.audit(VerificationRecord::resolve(
                &pending,
                answer,
                Verdict::Declined,
                verification.reason,
                now,
            ))
            .await;
        }

        Ok(())
    }

    /// Admin command changing a group's challenge topic
    pub async fn set_topic(
        &self,
        chat_id: ChatId,
        requester: UserId,
        role: MemberRole,
        new_topic: &str,
    ) {
        if let Err(e) = self.process_set_topic(chat_id, requester, role, new_topic).await {
            tracing::error!(chat_id = %chat_id, error = %e, "Topic update failed");
            self.notifier
                .send(chat_id, &self.messages().internal_error)
                .await;
        }
    }

    async fn process_set_topic(
        &self,
        chat_id: ChatId,
        requester: UserId,
        role: MemberRole,
        new_topic: &str,
    ) -> Result<(), BouncerError> {
        if !self.store.is_group_allowed(chat_id).await? {
            tracing::warn!(chat_id = %chat_id, "Topic command in a group that is not allowed");
            return Ok(());
        }

        if !role.can_manage() {
            tracing::info!(chat_id = %chat_id, user_id = %requester, ?role, "Topic change by non-admin rejected");
            return Ok(());
        }

        let topic = new_topic.trim();
        if topic.is_empty() {
            self.notifier
                .send(chat_id, &self.messages().topic_usage)
                .await;
            return Ok(());
        }

        self.store.set_group_topic(chat_id, topic).await?;
        tracing::info!(chat_id = %chat_id, user_id = %requester, topic = %topic, "Group topic updated");

        let text = render(&self.messages().topic_updated, &[&topic]);
        self.notifier.send(chat_id, &text).await;
        Ok(())
    }

    /// Resolve pending entries left behind by a previous process. Expired
    /// entries are timed out now; open ones get a timeout for what is left.
    pub async fn recover_pending(&self, now: DateTime<Utc>) -> Result<Recovery, BouncerError> {
        let mut recovery = Recovery::default();

        for pending in self.store.list_pending().await? {
            if pending.is_expired(now, self.settings.answer_timeout) {
                if self
                    .store
                    .remove_pending(pending.user_id, pending.issued_at_ms)
                    .await?
                {
                    self.resolve_timed_out(&pending, now).await;
                    recovery.expired += 1;
                }
            } else {
                let remaining = pending.remaining(now, self.settings.answer_timeout);
                self.scheduler
                    .schedule(TimeoutJob::for_pending(&pending), remaining);
                recovery.rescheduled += 1;
            }
        }

        if recovery != Recovery::default() {
            tracing::info!(
                expired = recovery.expired,
                rescheduled = recovery.rescheduled,
                "Recovered pending challenges"
            );
        }
        Ok(recovery)
    }

    async fn notify_user(&self, user_id: UserId, text: &str) {
        self.notifier.send(user_id.private_chat(), text).await;
    }

    async fn approve(&self, chat_id: ChatId, user_id: UserId) {
        if let Err(e) = self.platform.approve(chat_id, user_id).await {
            tracing::warn!(chat_id = %chat_id, user_id = %user_id, error = %e, "Failed to approve join request");
        }
    }

    async fn decline(&self, chat_id: ChatId, user_id: UserId) {
        if let Err(e) = self.platform.decline(chat_id, user_id).await {
            tracing::warn!(chat_id = %chat_id, user_id = %user_id, error = %e, "Failed to decline join request");
        }
    }

    /// Audit writes happen after the user-visible transition; a failure is
    /// logged rather than undoing it
    async fn audit(&self, record: VerificationRecord) {
        if let Err(e) = self.store.record_verification(&record).await {
            tracing::error!(
                user_id = %record.user_id,
                verdict = %record.verdict,
                error = %e,
                "Failed to write verification record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::GenerationError;
    use crate::ai::testing::ScriptedAi;
    use crate::config::PromptTemplates;
    use crate::lifecycle::scheduler::testing::ManualScheduler;
    use crate::storage::MemoryStore;
    use crate::storage::testing::InterleavingStore;
    use crate::telegram::testing::{Action, RecordingPlatform};
    use bouncer_common::AllowedGroup;

    const GROUP: ChatId = ChatId(42);
    const USER: UserId = UserId(1001);
    const CHALLENGE: &str = "What is H2O?";

    fn messages() -> BotMessages {
        BotMessages {
            internal_error: "internal error".into(),
            join_requested: "Hi {}! To join {} answer: {} ({}s)".into(),
            correct_answer: "welcome".into(),
            wrong_answer: "wrong, retry in {}s".into(),
            timed_out: "timed out, retry in {}s".into(),
            ongoing_challenge: "ongoing".into(),
            no_challenge: "no challenge".into(),
            retry_timer: "wait {}s".into(),
            topic_usage: "usage".into(),
            topic_updated: "topic is now {}".into(),
        }
    }

    /// Generates CHALLENGE; verification passes iff the answer mentions water
    fn quiz_ai() -> ScriptedAi {
        ScriptedAi::new(|prompt| {
            if let Some(rest) = prompt.strip_prefix("VERIFY|") {
                let parts: Vec<&str> = rest.split('|').collect();
                if parts[1].contains("water") {
                    Ok(parts[2].to_string())
                } else {
                    Ok("Answer does not match".to_string())
                }
            } else {
                Ok(CHALLENGE.to_string())
            }
        })
    }

    struct Harness {
        store: Arc<MemoryStore>,
        platform: Arc<RecordingPlatform>,
        scheduler: Arc<ManualScheduler>,
        ai: Arc<ScriptedAi>,
        controller: Controller,
    }

    async fn harness_with(ai: ScriptedAi) -> Harness {
        build_harness(ai, false).await
    }

    /// Harness whose controller yields before every store call
    async fn interleaving_harness() -> Harness {
        build_harness(quiz_ai(), true).await
    }

    async fn build_harness(ai: ScriptedAi, interleave: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store
            .allow_group(&AllowedGroup {
                chat_id: GROUP,
                display_name: "Science Club".into(),
            })
            .await
            .unwrap();
        store.set_group_topic(GROUP, "science").await.unwrap();

        let platform = Arc::new(RecordingPlatform::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let ai = Arc::new(ai);
        let generator = ChallengeGenerator::new(
            ai.clone(),
            PromptTemplates {
                generate_challenge: "Ask about {}".into(),
                verify_answer: "VERIFY|{}|{}|{}".into(),
            },
        );

        let controller_store: Arc<dyn Store> = if interleave {
            Arc::new(InterleavingStore(store.clone()))
        } else {
            store.clone()
        };

        let controller = Controller::new(
            controller_store,
            generator,
            platform.clone(),
            scheduler.clone(),
            LifecycleSettings {
                messages: messages(),
                answer_timeout: Duration::from_secs(120),
                retry_timeout: Duration::from_secs(600),
            },
        );

        Harness {
            store,
            platform,
            scheduler,
            ai,
            controller,
        }
    }

    async fn harness() -> Harness {
        harness_with(quiz_ai()).await
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn request(chat_id: ChatId) -> JoinRequest {
        JoinRequest {
            chat_id,
            chat_title: "Science Club".into(),
            user_id: USER,
            display_name: "Ada".into(),
        }
    }

    fn dm() -> ChatId {
        USER.private_chat()
    }

    impl Harness {
        async fn join(&self, now: DateTime<Utc>) {
            self.controller.handle_join_request(&request(GROUP), now).await;
        }

        async fn answer(&self, text: &str, now: DateTime<Utc>) {
            self.controller
                .handle_answer(USER, "Ada", "Ada", text, now)
                .await;
        }

        async fn pending(&self) -> Option<PendingChallenge> {
            self.store.get_pending(USER).await.unwrap()
        }

        async fn records(&self) -> Vec<VerificationRecord> {
            self.store.recent_verifications(100).await.unwrap()
        }

        fn pending_template(&self) -> PendingChallenge {
            PendingChallenge {
                user_id: USER,
                chat_id: GROUP,
                chat_title: "Science Club".into(),
                display_name: "Ada".into(),
                issued_at_ms: 0,
                challenge: CHALLENGE.into(),
            }
        }
    }

    #[tokio::test]
    async fn test_not_allowed_group_is_silent() {
        let h = harness().await;
        h.controller
            .handle_join_request(&request(ChatId(-999)), at(1_000))
            .await;

        assert!(h.pending().await.is_none());
        assert!(h.platform.actions().is_empty());
        assert_eq!(h.ai.call_count(), 0);
    }

    #[tokio::test]
    async fn test_challenge_issued_end_to_end_accept() {
        let h = harness().await;
        h.join(at(1_000)).await;

        assert_eq!(h.ai.call_count(), 1);
        assert_eq!(h.ai.prompts()[0], "Ask about science");

        let pending = h.pending().await.unwrap();
        assert_eq!(pending.chat_id, GROUP);
        assert_eq!(pending.challenge, CHALLENGE);
        assert_eq!(pending.issued_at_ms, 1_000_000);
        assert_eq!(h.store.last_join_attempt(USER).await.unwrap(), Some(1_000));
        assert_eq!(
            h.platform.sent_to(dm()),
            vec![format!("Hi Ada! To join Science Club answer: {} (120s)", CHALLENGE)]
        );

        let scheduled = h.scheduler.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].1, Duration::from_secs(120));
        assert_eq!(scheduled[0].0.issued_at_ms, 1_000_000);

        h.platform.clear();
        h.answer("It is water", at(1_060)).await;

        assert_eq!(
            h.platform.actions(),
            vec![
                Action::Approve(GROUP, USER),
                Action::Send(dm(), "welcome".into()),
            ]
        );
        assert!(h.pending().await.is_none());
        assert_eq!(h.scheduler.cancelled(), vec![(USER, 1_000_000)]);

        let records = h.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].verdict, Verdict::Accepted);
        assert_eq!(records[0].reason, "");
        assert_eq!(records[0].answer, "It is water");
        assert_eq!(records[0].chat_title, "Science Club");
    }

    #[tokio::test]
    async fn test_wrong_answer_declines_with_reason() {
        let h = harness().await;
        h.join(at(1_000)).await;
        h.platform.clear();

        h.answer("fire", at(1_010)).await;

        assert_eq!(
            h.platform.actions(),
            vec![
                Action::Decline(GROUP, USER),
                Action::Send(dm(), "wrong, retry in 600s".into()),
            ]
        );
        assert!(h.pending().await.is_none());

        let records = h.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].verdict, Verdict::Declined);
        assert_eq!(records[0].reason, "Answer does not match");
    }

    #[tokio::test]
    async fn test_late_answer_declines_without_record() {
        let h = harness().await;
        h.join(at(1_000)).await;
        h.platform.clear();

        h.answer("water", at(1_121)).await;

        assert_eq!(
            h.platform.actions(),
            vec![
                Action::Decline(GROUP, USER),
                Action::Send(dm(), "no challenge".into()),
            ]
        );
        assert!(h.pending().await.is_none());
        assert!(h.records().await.is_empty());
        // Only the challenge itself was generated
        assert_eq!(h.ai.call_count(), 1);
    }

    #[tokio::test]
    async fn test_answer_without_challenge() {
        let h = harness().await;
        h.answer("hello", at(1_000)).await;

        assert_eq!(h.platform.actions(), vec![Action::Send(dm(), "no challenge".into())]);
        assert!(h.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_join_while_pending() {
        let h = harness().await;
        h.join(at(1_000)).await;
        let first = h.pending().await.unwrap();
        h.platform.clear();

        h.join(at(1_005)).await;

        assert_eq!(h.platform.actions(), vec![Action::Send(dm(), "ongoing".into())]);
        assert_eq!(h.pending().await.unwrap(), first);
        assert_eq!(h.ai.call_count(), 1);
        assert_eq!(h.scheduler.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_reports_remaining_seconds() {
        let h = harness().await;
        h.store
            .record_join_attempt(&JoinAttempt {
                timestamp: 1_000,
                user_id: USER,
                display_name: "Ada".into(),
            })
            .await
            .unwrap();

        h.join(at(1_100)).await;

        assert_eq!(
            h.platform.actions(),
            vec![
                Action::Decline(GROUP, USER),
                Action::Send(dm(), "wait 500s".into()),
            ]
        );
        assert!(h.pending().await.is_none());
        assert_eq!(h.ai.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cooldown_elapsed_allows_new_challenge() {
        let h = harness().await;
        h.join(at(1_000)).await;
        h.answer("fire", at(1_010)).await;
        h.platform.clear();

        h.join(at(1_600)).await;
        assert!(h.pending().await.is_some());
        assert_eq!(h.ai.call_count(), 3);
    }

    #[tokio::test]
    async fn test_missing_topic_is_silent() {
        let h = harness().await;
        let other = ChatId(43);
        h.store
            .allow_group(&AllowedGroup {
                chat_id: other,
                display_name: "No Topic".into(),
            })
            .await
            .unwrap();

        h.controller.handle_join_request(&request(other), at(1_000)).await;

        assert!(h.platform.actions().is_empty());
        assert!(h.pending().await.is_none());
        assert_eq!(h.ai.call_count(), 0);
    }

    #[tokio::test]
    async fn test_generation_failure_sends_internal_error() {
        let h = harness_with(ScriptedAi::new(|_| {
            Err(GenerationError::Http {
                status: 500,
                body: "upstream exploded".into(),
            })
        }))
        .await;

        h.join(at(1_000)).await;

        assert_eq!(h.platform.actions(), vec![Action::Send(dm(), "internal error".into())]);
        assert!(h.pending().await.is_none());
        assert!(h.scheduler.scheduled().is_empty());
        // No attempt recorded, so the user may retry right away
        assert_eq!(h.store.last_join_attempt(USER).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_verification_failure_declines_and_records() {
        let h = harness_with(ScriptedAi::new(|prompt| {
            if prompt.starts_with("VERIFY|") {
                Err(GenerationError::Request("connection reset".into()))
            } else {
                Ok(CHALLENGE.to_string())
            }
        }))
        .await;
        h.join(at(1_000)).await;
        h.platform.clear();

        h.answer("water", at(1_010)).await;

        assert_eq!(
            h.platform.actions(),
            vec![
                Action::Decline(GROUP, USER),
                Action::Send(dm(), "internal error".into()),
            ]
        );
        let records = h.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, REASON_VERIFICATION_ERROR);
        assert!(h.pending().await.is_none());
    }

    #[tokio::test]
    async fn test_blocked_user_still_gets_challenge_state() {
        let h = harness().await;
        h.platform.block(dm());

        h.join(at(1_000)).await;

        assert!(h.pending().await.is_some());
        assert_eq!(h.scheduler.scheduled().len(), 1);

        h.answer("water", at(1_050)).await;
        assert_eq!(h.platform.actions(), vec![Action::Approve(GROUP, USER)]);
        assert_eq!(h.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_declines_and_records() {
        let h = harness().await;
        h.join(at(1_000)).await;
        h.platform.clear();

        let job = h.scheduler.last_job();
        h.controller.handle_timeout(&job, at(1_120)).await;

        assert_eq!(
            h.platform.actions(),
            vec![
                Action::Decline(GROUP, USER),
                Action::Send(dm(), "timed out, retry in 600s".into()),
            ]
        );
        assert!(h.pending().await.is_none());

        let records = h.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].verdict, Verdict::Declined);
        assert_eq!(records[0].reason, REASON_TIMED_OUT);
        assert_eq!(records[0].answer, "");
    }

    #[tokio::test]
    async fn test_timeout_after_answer_is_stale() {
        let h = harness().await;
        h.join(at(1_000)).await;
        let job = h.scheduler.last_job();
        h.answer("water", at(1_030)).await;
        h.platform.clear();

        h.controller.handle_timeout(&job, at(1_120)).await;

        assert!(h.platform.actions().is_empty());
        assert_eq!(h.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_for_replaced_challenge_is_stale() {
        let h = harness().await;
        h.join(at(1_000)).await;
        let old_job = h.scheduler.last_job();

        // A newer challenge for the same user under a different fence
        h.store.remove_pending(USER, old_job.issued_at_ms).await.unwrap();
        let newer = PendingChallenge {
            issued_at_ms: 2_000_000,
            ..h.pending_template()
        };
        h.store.insert_pending(&newer).await.unwrap();
        h.platform.clear();

        h.controller.handle_timeout(&old_job, at(1_120)).await;

        assert!(h.platform.actions().is_empty());
        assert_eq!(h.pending().await.unwrap(), newer);
        assert!(h.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_answer_after_timeout_sees_no_challenge() {
        let h = harness().await;
        h.join(at(1_000)).await;
        let job = h.scheduler.last_job();
        h.controller.handle_timeout(&job, at(1_120)).await;
        h.platform.clear();

        h.answer("water", at(1_125)).await;

        assert_eq!(h.platform.actions(), vec![Action::Send(dm(), "no challenge".into())]);
        assert_eq!(h.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_answer_resolves_once() {
        let h = interleaving_harness().await;
        h.join(at(1_000)).await;
        h.platform.clear();

        // Both answers read the entry before either claims it
        tokio::join!(h.answer("water", at(1_010)), h.answer("water", at(1_011)));

        let actions = h.platform.actions();
        let approvals = actions
            .iter()
            .filter(|a| matches!(a, Action::Approve(..)))
            .count();
        assert_eq!(approvals, 1);
        assert_eq!(h.platform.sent_to(dm()), vec!["welcome".to_string()]);
        assert_eq!(h.records().await.len(), 1);
        // One generation plus a single verification
        assert_eq!(h.ai.call_count(), 2);
        assert!(h.pending().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_join_requests_issue_one_challenge() {
        let h = harness_with(quiz_ai().yielding()).await;

        futures::future::join_all((0..4).map(|i| h.join(at(1_000 + i)))).await;

        // Every request got past the pending check and raced on the insert
        assert_eq!(h.ai.call_count(), 4);
        assert_eq!(h.store.list_pending().await.unwrap().len(), 1);
        assert_eq!(h.scheduler.scheduled().len(), 1);

        let sent = h.platform.sent_to(dm());
        assert_eq!(sent.iter().filter(|m| *m == "ongoing").count(), 3);
        assert_eq!(sent.iter().filter(|m| m.starts_with("Hi Ada!")).count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_join_requests_with_interleaved_store() {
        let h = interleaving_harness().await;

        futures::future::join_all((0..4).map(|i| h.join(at(1_000 + i)))).await;

        assert_eq!(h.ai.call_count(), 4);
        assert_eq!(h.store.list_pending().await.unwrap().len(), 1);
        assert_eq!(h.scheduler.scheduled().len(), 1);
        assert_eq!(h.platform.sent_to(dm()).iter().filter(|m| *m == "ongoing").count(), 3);
    }

    #[tokio::test]
    async fn test_set_topic_requires_admin() {
        let h = harness().await;

        h.controller
            .set_topic(GROUP, USER, MemberRole::Member, "history")
            .await;
        assert_eq!(h.store.get_group_topic(GROUP).await.unwrap().as_deref(), Some("science"));
        assert!(h.platform.actions().is_empty());

        h.controller
            .set_topic(GROUP, USER, MemberRole::Administrator, "  history  ")
            .await;
        assert_eq!(h.store.get_group_topic(GROUP).await.unwrap().as_deref(), Some("history"));
        assert_eq!(h.platform.sent_to(GROUP), vec!["topic is now history".to_string()]);
    }

    #[tokio::test]
    async fn test_set_topic_usage_and_allowlist() {
        let h = harness().await;

        h.controller.set_topic(GROUP, USER, MemberRole::Owner, "   ").await;
        assert_eq!(h.platform.sent_to(GROUP), vec!["usage".to_string()]);

        let stranger = ChatId(-5);
        h.controller
            .set_topic(stranger, USER, MemberRole::Owner, "history")
            .await;
        assert!(h.store.get_group_topic(stranger).await.unwrap().is_none());
        assert!(h.platform.sent_to(stranger).is_empty());
    }

    #[tokio::test]
    async fn test_recover_pending() {
        let h = harness().await;
        let expired = PendingChallenge {
            issued_at_ms: 1_000_000,
            ..h.pending_template()
        };
        let open = PendingChallenge {
            user_id: UserId(2002),
            issued_at_ms: 1_100_000,
            ..h.pending_template()
        };
        h.store.insert_pending(&expired).await.unwrap();
        h.store.insert_pending(&open).await.unwrap();

        let recovery = h.controller.recover_pending(at(1_150)).await.unwrap();

        assert_eq!(
            recovery,
            Recovery {
                expired: 1,
                rescheduled: 1
            }
        );
        assert!(h.pending().await.is_none());
        assert_eq!(
            h.platform.actions(),
            vec![
                Action::Decline(GROUP, USER),
                Action::Send(dm(), "timed out, retry in 600s".into()),
            ]
        );
        assert_eq!(h.records().await[0].reason, REASON_TIMED_OUT);

        let scheduled = h.scheduler.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].0.user_id, UserId(2002));
        assert_eq!(scheduled[0].1, Duration::from_secs(70));
    }
}
