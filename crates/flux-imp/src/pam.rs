//! PAM session handling, compiled only with the `pam` cargo feature.
//!
//! The session is opened in the privileged parent before the fork and
//! closed after the job shell has been reaped, so session modules (limits,
//! keyrings, systemd) see the whole job lifetime.

use pam_client::conv_null::Conversation;
use pam_client::{Context, Flag, Session, SessionToken};

use crate::error::ImpError;

const SERVICE: &str = "flux-imp";

/// An open PAM session for the target user.
pub struct PamSession {
    context: Context<Conversation>,
    token: Option<SessionToken>,
}

impl PamSession {
    /// Authenticates account validity and opens a session for `user`.
    pub fn open(user: &str) -> Result<Self, ImpError> {
        let mut context = Context::new(SERVICE, Some(user), Conversation::new())
            .map_err(|e| ImpError::Privsep(format!("PAM init for {user}: {e}")))?;
        context
            .acct_mgmt(Flag::NONE)
            .map_err(|e| ImpError::Privsep(format!("PAM account check for {user}: {e}")))?;
        let session: Session<'_, Conversation> = context
            .open_session(Flag::NONE)
            .map_err(|e| ImpError::Privsep(format!("PAM session for {user}: {e}")))?;
        let token = session.leak();
        Ok(Self {
            context,
            token: Some(token),
        })
    }

    /// Closes the session. Errors are logged, not fatal: the job already
    /// ran.
    pub fn close(mut self) {
        if let Some(token) = self.token.take() {
            match self.context.unleak_session(token) {
                Ok(session) => drop(session),
                Err(e) => tracing::warn!("PAM session close: {e}"),
            }
        }
    }
}
