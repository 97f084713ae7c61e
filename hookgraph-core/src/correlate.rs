//! Pre/post tool-call correlation
//!
//! Each tool invocation arrives as two independent hook calls. A "before"
//! half is parked in a [`PendingIndex`] under its call identity; the "after"
//! half takes it back out and the two merge into a [`CompletedCall`].
//!
//! ```text
//! NONE --pre--> PENDING --post--> MATCHED
//!                  |
//!                  +----ttl-----> EVICTED (surfaced as orphaned_pre)
//! NONE --post (no pending)------> orphaned_post
//! ```
//!
//! The index is the only state; the correlator itself is a set of pure
//! transitions over it, so the same code runs against the SQLite-backed
//! index inside a session transaction and the in-memory one in tests.

use crate::classify::{detect_outcome, sanitize_input};
use crate::error::Result;
use crate::event::{ToolPost, ToolPre};
use crate::types::{CallOrigin, PendingCall};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Storage for "before" halves awaiting their match.
///
/// Implementations only insert, remove, and remove-expired; entries are
/// never mutated in place.
pub trait PendingIndex {
    /// Insert a half, returning the one it replaced under the same identity.
    fn put(&mut self, half: PendingCall) -> Result<Option<PendingCall>>;

    /// Remove and return the half with this identity.
    fn take(&mut self, call_id: &str) -> Result<Option<PendingCall>>;

    /// Remove and return every half that started before `cutoff`.
    ///
    /// `session_id` limits the sweep to one session.
    fn take_expired(
        &mut self,
        session_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingCall>>;
}

/// In-process pending index
#[derive(Debug, Default)]
pub struct MemoryPendingIndex {
    halves: HashMap<String, PendingCall>,
}

impl MemoryPendingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.halves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.halves.is_empty()
    }
}

impl PendingIndex for MemoryPendingIndex {
    fn put(&mut self, half: PendingCall) -> Result<Option<PendingCall>> {
        Ok(self.halves.insert(half.call_id.clone(), half))
    }

    fn take(&mut self, call_id: &str) -> Result<Option<PendingCall>> {
        Ok(self.halves.remove(call_id))
    }

    fn take_expired(
        &mut self,
        session_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingCall>> {
        let expired: Vec<String> = self
            .halves
            .values()
            .filter(|h| h.started_at < cutoff)
            .filter(|h| session_id.map_or(true, |s| h.session_id == s))
            .map(|h| h.call_id.clone())
            .collect();

        let mut taken: Vec<PendingCall> = expired
            .iter()
            .filter_map(|id| self.halves.remove(id))
            .collect();
        taken.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(taken)
    }
}

/// A tool invocation after correlation, before sequencing.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCall {
    pub call_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    /// Sanitized input
    pub input: Value,
    /// Raw response, kept for output text and path expansion
    pub response: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `None` when only one half was seen
    pub duration_ms: Option<i64>,
    /// `None` when the outcome was never observed
    pub success: Option<bool>,
    pub error: Option<String>,
    pub origin: CallOrigin,
}

/// Result of handling a "before" half
#[derive(Debug, Clone, PartialEq)]
pub struct PreOutcome {
    pub call_id: String,
    /// A still-pending half with the same identity was discarded
    pub replaced: bool,
}

/// Matches pre/post halves and evicts stale ones
#[derive(Debug, Clone)]
pub struct Correlator {
    ttl: Duration,
}

impl Correlator {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(300)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Identity shared by both halves of one invocation.
    ///
    /// Uses the host's tool-use token when present, otherwise a hash of the
    /// sanitized input. The composite form cannot tell apart two concurrent
    /// calls with identical input; the later one wins.
    pub fn call_identity(
        session_id: &str,
        tool_name: &str,
        tool_use_id: Option<&str>,
        input: &Value,
    ) -> String {
        match tool_use_id {
            Some(token) => format!("{}:{}:{}", session_id, tool_name, token),
            None => {
                let digest = Sha256::digest(input.to_string().as_bytes());
                format!("{}:{}:h{}", session_id, tool_name, hex::encode(&digest[..8]))
            }
        }
    }

    /// Park a "before" half. Last write wins on identity collision.
    pub fn on_pre<P: PendingIndex + ?Sized>(&self, index: &mut P, pre: &ToolPre) -> Result<PreOutcome> {
        let input = sanitize_input(&pre.tool_input);
        let call_id = Self::call_identity(
            &pre.session_id,
            &pre.tool_name,
            pre.tool_use_id.as_deref(),
            &input,
        );

        let replaced = index.put(PendingCall {
            call_id: call_id.clone(),
            session_id: pre.session_id.clone(),
            tool_name: pre.tool_name.clone(),
            tool_use_id: pre.tool_use_id.clone(),
            input,
            started_at: pre.timestamp,
        })?;

        if let Some(old) = &replaced {
            tracing::debug!(
                call_id = %call_id,
                previous_started_at = %old.started_at,
                "Pending half replaced by retried invocation"
            );
        }

        Ok(PreOutcome {
            call_id,
            replaced: replaced.is_some(),
        })
    }

    /// Complete an invocation from its "after" half.
    ///
    /// Without a pending half the call is synthesized as `orphaned_post`
    /// with an unknown duration.
    pub fn on_post<P: PendingIndex + ?Sized>(&self, index: &mut P, post: &ToolPost) -> Result<CompletedCall> {
        let input = sanitize_input(&post.tool_input);
        let call_id = Self::call_identity(
            &post.session_id,
            &post.tool_name,
            post.tool_use_id.as_deref(),
            &input,
        );

        let (success, error) = post_outcome(post);

        match index.take(&call_id)? {
            Some(pre) => {
                let duration = (post.timestamp - pre.started_at).num_milliseconds().max(0);
                Ok(CompletedCall {
                    call_id,
                    session_id: post.session_id.clone(),
                    tool_name: post.tool_name.clone(),
                    tool_use_id: post.tool_use_id.clone().or(pre.tool_use_id),
                    // The pre half saw the input first; post input may be absent
                    input: if pre.input.is_null() { input } else { pre.input },
                    response: post.tool_response.clone(),
                    started_at: Some(pre.started_at),
                    ended_at: Some(post.timestamp),
                    duration_ms: Some(duration),
                    success: Some(success),
                    error,
                    origin: CallOrigin::Matched,
                })
            }
            None => {
                tracing::debug!(call_id = %call_id, "Post half without pending pre half");
                Ok(CompletedCall {
                    call_id,
                    session_id: post.session_id.clone(),
                    tool_name: post.tool_name.clone(),
                    tool_use_id: post.tool_use_id.clone(),
                    input,
                    response: post.tool_response.clone(),
                    started_at: None,
                    ended_at: Some(post.timestamp),
                    duration_ms: None,
                    success: Some(success),
                    error,
                    origin: CallOrigin::OrphanedPost,
                })
            }
        }
    }

    /// Drop halves older than the TTL, surfacing each as `orphaned_pre`.
    ///
    /// Removal happens before the calls are returned, so an evicted half is
    /// reported exactly once.
    pub fn evict<P: PendingIndex + ?Sized>(
        &self,
        index: &mut P,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CompletedCall>> {
        let expired = index.take_expired(session_id, now - self.ttl)?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Evicted expired pending tool calls");
        }

        Ok(expired
            .into_iter()
            .map(|half| CompletedCall {
                call_id: half.call_id,
                session_id: half.session_id,
                tool_name: half.tool_name,
                tool_use_id: half.tool_use_id,
                input: half.input,
                response: Value::Null,
                started_at: Some(half.started_at),
                ended_at: None,
                duration_ms: None,
                success: None,
                error: None,
                origin: CallOrigin::OrphanedPre,
            })
            .collect())
    }
}

/// Success and error text for an "after" half.
///
/// An explicit host flag wins; an explicit error field means failure;
/// otherwise the response is scanned.
fn post_outcome(post: &ToolPost) -> (bool, Option<String>) {
    let detected = detect_outcome(&post.tool_response);
    let error = post.error.clone().or(detected.error.clone());
    let success = match (post.success, &post.error) {
        (Some(flag), _) => flag,
        (None, Some(_)) => false,
        (None, None) => detected.success,
    };
    (success, if success { None } else { error })
}
