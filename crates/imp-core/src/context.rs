//! The process security context.
//!
//! A context owns the merged configuration and a lazily-created sign
//! engine, and keeps the last failure rendered as a one-line message for
//! callers that report diagnostics without threading error values (the
//! `sign` CLI, the IMP's die paths).
//!
//! Contexts are single-threaded by contract: scratch buffers and the
//! last-error slot are context-local. Independent contexts may coexist.

use std::cell::RefCell;
use std::env;

use crate::config::SecurityConfig;
use crate::error::{ConfigError, SignError};
use crate::sign::munge::CredentialAgent;
use crate::sign::{SignEngine, UnwrapMode, Unwrapped};

/// Environment variable naming the config file glob.
pub const CONFIG_PATTERN_ENV: &str = "FLUX_IMP_CONFIG_PATTERN";

/// Process security context: configuration plus the sign engine.
pub struct SecurityContext {
    config: SecurityConfig,
    engine: Option<SignEngine>,
    agent: Option<Box<dyn CredentialAgent>>,
    last_error: RefCell<Option<String>>,
}

impl SecurityContext {
    /// Creates a context over an already-loaded configuration.
    #[must_use]
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            config,
            engine: None,
            agent: None,
            last_error: RefCell::new(None),
        }
    }

    /// Creates a context by loading configuration from `pattern`, or from
    /// `FLUX_IMP_CONFIG_PATTERN` when `pattern` is `None`.
    ///
    /// # Errors
    ///
    /// Returns `PatternUnset` when no pattern is available, and the
    /// loader's errors otherwise.
    pub fn configure(pattern: Option<&str>) -> Result<Self, ConfigError> {
        let pattern = match pattern {
            Some(p) => p.to_string(),
            None => env::var(CONFIG_PATTERN_ENV).map_err(|_| ConfigError::PatternUnset)?,
        };
        Ok(Self::new(SecurityConfig::load_pattern(&pattern)?))
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Installs the external credential daemon connection used by the
    /// munge mechanism. Must be called before the first wrap/unwrap.
    pub fn set_credential_agent(&mut self, agent: Box<dyn CredentialAgent>) {
        self.agent = Some(agent);
    }

    /// The message from the most recent failed operation, if any. The
    /// slot is replaced on each failure.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    /// Wraps `payload` in a signed envelope claiming `userid`. The result
    /// borrows the context and is invalidated by the next call.
    ///
    /// # Errors
    ///
    /// As [`SignEngine::wrap_as`]; the message is also stashed for
    /// [`last_error`](Self::last_error).
    pub fn sign_wrap_as(
        &mut self,
        userid: u32,
        payload: &[u8],
        mech_type: Option<&str>,
    ) -> Result<&str, SignError> {
        if let Err(err) = self.try_wrap_as(userid, payload, mech_type) {
            self.stash(&err);
            return Err(err);
        }
        match &self.engine {
            Some(engine) => Ok(engine.wrap_result()),
            None => Err(SignError::ConfigInvalid(
                "sign engine not initialized".to_string(),
            )),
        }
    }

    /// Wraps `payload` claiming the current real uid.
    ///
    /// # Errors
    ///
    /// As [`sign_wrap_as`](Self::sign_wrap_as).
    pub fn sign_wrap(
        &mut self,
        payload: &[u8],
        mech_type: Option<&str>,
    ) -> Result<&str, SignError> {
        self.sign_wrap_as(nix::unistd::getuid().as_raw(), payload, mech_type)
    }

    /// Unwraps an envelope, enforcing `allowed-types`.
    ///
    /// # Errors
    ///
    /// As [`SignEngine::unwrap`]; the message is also stashed.
    pub fn sign_unwrap(
        &mut self,
        input: &str,
        mode: UnwrapMode,
    ) -> Result<Unwrapped<'_>, SignError> {
        self.unwrap_common(input, mode, true)
    }

    /// Unwraps an envelope without the `allowed-types` check.
    ///
    /// # Errors
    ///
    /// As [`SignEngine::unwrap_anymech`]; the message is also stashed.
    pub fn sign_unwrap_anymech(
        &mut self,
        input: &str,
        mode: UnwrapMode,
    ) -> Result<Unwrapped<'_>, SignError> {
        self.unwrap_common(input, mode, false)
    }

    fn unwrap_common(
        &mut self,
        input: &str,
        mode: UnwrapMode,
        check_allowed: bool,
    ) -> Result<Unwrapped<'_>, SignError> {
        match self.try_unwrap(input, mode, check_allowed) {
            Ok((userid, mechanism)) => match &self.engine {
                Some(engine) => Ok(Unwrapped {
                    payload: engine.unwrap_result(),
                    userid,
                    mechanism,
                }),
                None => Err(SignError::ConfigInvalid(
                    "sign engine not initialized".to_string(),
                )),
            },
            Err(err) => {
                self.stash(&err);
                Err(err)
            }
        }
    }

    fn try_wrap_as(
        &mut self,
        userid: u32,
        payload: &[u8],
        mech_type: Option<&str>,
    ) -> Result<(), SignError> {
        let engine = self.engine_mut()?;
        engine.wrap_as(userid, payload, mech_type)?;
        Ok(())
    }

    fn try_unwrap(
        &mut self,
        input: &str,
        mode: UnwrapMode,
        check_allowed: bool,
    ) -> Result<(u32, &'static str), SignError> {
        let engine = self.engine_mut()?;
        let unwrapped = if check_allowed {
            engine.unwrap(input, mode)?
        } else {
            engine.unwrap_anymech(input, mode)?
        };
        Ok((unwrapped.userid, unwrapped.mechanism))
    }

    /// Creates the sign engine on first use.
    fn engine_mut(&mut self) -> Result<&mut SignEngine, SignError> {
        if self.engine.is_none() {
            let sign_config = self.config.sign.as_ref().ok_or_else(|| {
                SignError::ConfigInvalid("[sign] config missing".to_string())
            })?;
            let engine = SignEngine::new(sign_config, self.agent.take())?;
            self.engine = Some(engine);
        }
        match &mut self.engine {
            Some(engine) => Ok(engine),
            None => Err(SignError::ConfigInvalid(
                "sign engine not initialized".to_string(),
            )),
        }
    }

    fn stash(&self, err: &SignError) {
        *self.last_error.borrow_mut() = Some(err.to_string());
    }
}
