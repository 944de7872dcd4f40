//! Policy session construction and scoped handle release
//!
//! A policy session runs `StartAuthSession -> PolicyPCR -> PolicyPassword ->
//! PolicyGetDigest`. The session handle is owned by a [`FlushGuard`] from the
//! moment it exists, so a failure at any later stage (or in the caller)
//! flushes it before the error leaves the call.

use crate::device::{PcrSelection, PolicyDigest, TpmChannel};
use crate::error::{SessionStage, TpmError, TpmResult};
use crate::handle::TpmHandle;
use std::fmt;
use tracing::{debug, warn};

/// What a guarded handle refers to, for log messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Session,
    Object,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Session => f.write_str("policy session"),
            HandleKind::Object => f.write_str("sealed object"),
        }
    }
}

/// Flushes a device handle when dropped.
///
/// The guard borrows the channel for its whole lifetime; further commands go
/// through [`FlushGuard::channel`].
pub struct FlushGuard<'a> {
    channel: &'a mut dyn TpmChannel,
    handle: TpmHandle,
    kind: HandleKind,
}

impl<'a> FlushGuard<'a> {
    pub fn new(channel: &'a mut dyn TpmChannel, handle: TpmHandle, kind: HandleKind) -> Self {
        Self {
            channel,
            handle,
            kind,
        }
    }

    pub fn handle(&self) -> TpmHandle {
        self.handle
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// The channel the guarded handle lives on
    pub fn channel(&mut self) -> &mut dyn TpmChannel {
        &mut *self.channel
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        flush_quietly(&mut *self.channel, self.handle, self.kind);
    }
}

impl fmt::Debug for FlushGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushGuard")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .finish()
    }
}

fn flush_quietly(channel: &mut dyn TpmChannel, handle: TpmHandle, kind: HandleKind) {
    if handle.is_null() {
        return;
    }
    match channel.flush_context(handle) {
        Ok(()) => debug!(target: "vault::tpm", "Flushed {} {}", kind, handle),
        Err(e) => warn!(target: "vault::tpm", "Failed to flush {} {}: {}", kind, handle, e),
    }
}

/// Flush a policy session; the null handle is a no-op and failures are
/// logged, never returned.
pub fn flush_session(channel: &mut dyn TpmChannel, session: TpmHandle) {
    flush_quietly(channel, session, HandleKind::Session);
}

/// Start a policy session requiring an (empty) PCR state and password
/// authorization, and read back its digest.
///
/// The session stays loaded for as long as the returned guard lives.
pub fn build_policy_session(
    channel: &mut dyn TpmChannel,
) -> TpmResult<(FlushGuard<'_>, PolicyDigest)> {
    let session = channel
        .start_policy_session()
        .map_err(|f| TpmError::session(SessionStage::Start, f))?;
    let mut guard = FlushGuard::new(channel, session, HandleKind::Session);

    guard
        .channel()
        .policy_pcr(session, &PcrSelection::empty())
        .map_err(|f| TpmError::session(SessionStage::BindPcr, f))?;
    guard
        .channel()
        .policy_password(session)
        .map_err(|f| TpmError::session(SessionStage::RequirePassword, f))?;
    let digest = guard
        .channel()
        .policy_get_digest(session)
        .map_err(|f| TpmError::session(SessionStage::ReadDigest, f))?;

    debug!(target: "vault::tpm", "Policy session {} digest {}", session, digest);
    Ok((guard, digest))
}
