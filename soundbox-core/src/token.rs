//! Request correlation: tokens pairing an outbound command with its
//! expected inbound reply, and the per-connection pending registry.
//!
//! A token is created by a public command method before the frame is
//! queued; the method then awaits the token until a terminal status is
//! reached. The receive path resolves inbound frames against the
//! registry. At most one token may be pending per expected command —
//! registering a newer one cancels the incumbent, so a late reply can
//! never satisfy the wrong logical request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::command::Command;
use crate::retry::Retry;

// ── TokenStatus ──────────────────────────────────────────────────

/// Lifecycle of a request token.
///
/// Transitions move strictly forward; `Canceled` and `Failed` are
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TokenStatus {
    Untouched,
    Sending,
    Sent,
    Replied,
    Canceled,
    Failed,
}

impl TokenStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TokenStatus::Replied | TokenStatus::Canceled | TokenStatus::Failed
        )
    }
}

// ── RequestToken ─────────────────────────────────────────────────

#[derive(Debug)]
struct TokenState {
    status: TokenStatus,
    reply: Option<Vec<u8>>,
}

/// Correlation object for one outbound command awaiting its reply.
#[derive(Debug)]
pub struct RequestToken {
    expect: Command,
    error_command: Option<Command>,
    expect_reply: Option<Vec<u8>>,
    state: Mutex<TokenState>,
    notify: Notify,
}

impl RequestToken {
    /// `expect` is the inbound command that resolves this token;
    /// `error_command` (if any) is the inbound command that fails it;
    /// `expect_reply` (if any) is the payload the reply is validated
    /// against in [`check_reply`](Self::check_reply).
    pub fn new(
        expect: Command,
        error_command: Option<Command>,
        expect_reply: Option<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            expect,
            error_command,
            expect_reply,
            state: Mutex::new(TokenState {
                status: TokenStatus::Untouched,
                reply: None,
            }),
            notify: Notify::new(),
        })
    }

    pub fn expect(&self) -> Command {
        self.expect
    }

    pub fn error_command(&self) -> Option<Command> {
        self.error_command
    }

    pub fn status(&self) -> TokenStatus {
        self.state.lock().unwrap().status
    }

    /// The reply payload, once the token is `Replied` or `Failed`.
    pub fn reply(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().reply.clone()
    }

    /// Advance the status, enforcing forward-only transitions with
    /// `Canceled`/`Failed` absorbing. Out-of-order updates (a `Sent`
    /// racing in after `Replied`) are dropped silently.
    pub fn advance(&self, next: TokenStatus) {
        let mut state = self.state.lock().unwrap();
        if state.status == TokenStatus::Canceled || state.status == TokenStatus::Failed {
            return;
        }
        if next > state.status {
            state.status = next;
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Mark `Replied` and store the reply payload.
    pub fn resolve(&self, payload: &[u8]) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() {
                return;
            }
            state.reply = Some(payload.to_vec());
            state.status = TokenStatus::Replied;
        }
        self.notify.notify_waiters();
    }

    /// Mark `Failed`, storing the device's error payload.
    pub fn fail(&self, payload: &[u8]) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() {
                return;
            }
            state.reply = Some(payload.to_vec());
            state.status = TokenStatus::Failed;
        }
        self.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() {
                return;
            }
            state.status = TokenStatus::Canceled;
        }
        self.notify.notify_waiters();
    }

    /// Compare the stored reply against the expected payload
    /// (`expected` overrides the one given at construction).
    pub fn check_reply(&self, expected: Option<&[u8]>) -> bool {
        let state = self.state.lock().unwrap();
        if state.status != TokenStatus::Replied {
            return false;
        }
        match (expected.or(self.expect_reply.as_deref()), &state.reply) {
            (Some(want), Some(got)) => want == got.as_slice(),
            // No expectation: any reply is acceptable.
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// Block until the frame has left the socket (status ≥ `Sent`) or
    /// the token dies. Each wake-timeout consumes one attempt of
    /// `retry`; on overflow the token is marked `Failed`.
    pub async fn wait_sent(&self, retry: &Retry) -> TokenStatus {
        self.wait_until(TokenStatus::Sent, retry).await
    }

    /// Block until the reply arrives (status ≥ `Replied`) or the token
    /// dies; overflow of `retry` marks the token `Failed`.
    pub async fn wait_replied(&self, retry: &Retry) -> TokenStatus {
        self.wait_until(TokenStatus::Replied, retry).await
    }

    async fn wait_until(&self, target: TokenStatus, retry: &Retry) -> TokenStatus {
        loop {
            // Arm the waiter before inspecting state so a notification
            // between the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let status = self.status();
            if status >= target || status.is_terminal() {
                return status;
            }
            if tokio::time::timeout(retry.timeout(), notified).await.is_err()
                && !retry.attempt()
            {
                self.advance(TokenStatus::Failed);
                return TokenStatus::Failed;
            }
        }
    }
}

// ── PendingRegistry ──────────────────────────────────────────────

/// Per-connection map of the single outstanding token per expected
/// command.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    inner: Mutex<HashMap<Command, Arc<RequestToken>>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a token, canceling any incumbent under the same
    /// expected command (stale-request eviction).
    pub fn register(&self, token: Arc<RequestToken>) {
        let evicted = self
            .inner
            .lock()
            .unwrap()
            .insert(token.expect(), token);
        if let Some(old) = evicted {
            old.cancel();
        }
    }

    /// Resolve the pending token expecting `command`, if any.
    pub fn resolve(&self, command: Command, payload: &[u8]) -> bool {
        let token = self.inner.lock().unwrap().remove(&command);
        match token {
            Some(token) => {
                token.resolve(payload);
                true
            }
            None => false,
        }
    }

    /// Fail the pending token whose error command is `command`, if any.
    pub fn fail(&self, command: Command, payload: &[u8]) -> bool {
        let mut map = self.inner.lock().unwrap();
        let key = map
            .iter()
            .find(|(_, token)| token.error_command() == Some(command))
            .map(|(key, _)| *key);
        match key.and_then(|key| map.remove(&key)) {
            Some(token) => {
                drop(map);
                token.fail(payload);
                true
            }
            None => false,
        }
    }

    /// Cancel everything still pending (connection is closing).
    pub fn cancel_all(&self) {
        let tokens: Vec<_> = self.inner.lock().unwrap().drain().collect();
        for (_, token) in tokens {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ────────────────────────────────────────────────────────
