use std::time::Duration;

use thiserror::Error;

/// Errors raised by signal handlers. The director logs them and carries on.
#[derive(Debug, Error)]
pub enum SignalError {
  #[error("unknown signal handler '{0}'")]
  UnknownHandler(String),

  #[error("invalid parameters for signal handler {handler}: {message}")]
  Params { handler: String, message: String },

  #[error("hook {hook} failed: {message}")]
  Hook { hook: String, message: String },

  #[error("hook {hook} timed out after {timeout:?}")]
  HookTimeout { hook: String, timeout: Duration },
}

impl SignalError {
  pub fn params(handler: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Params {
      handler: handler.into(),
      message: message.into(),
    }
  }

  pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Hook {
      hook: hook.into(),
      message: message.into(),
    }
  }
}
