use std::time::Duration;

use async_trait::async_trait;
use lava_connection::Pattern;
use lava_pipeline::{Action, ActionMeta, BuildContext, JobState, LavaError, TimeoutBudget};
use serde_json::{Value, json};
use tracing::info;

use crate::keys;

/// Waits for the booted system, logging in first when `auto_login` is set.
pub struct AutoLoginAction {
  meta: ActionMeta,
  wait: Duration,
}

impl AutoLoginAction {
  pub fn new() -> Box<dyn Action> {
    Box::new(Self {
      meta: ActionMeta::new(
        "auto-login-action",
        "automatically login after boot using job parameters and checking for messages.",
        "Auto-login after boot with support for kernel messages.",
      ),
      wait: Duration::from_secs(300),
    })
  }

  fn prompts(&self) -> Vec<&str> {
    match self.meta.parameters.get("prompts") {
      Some(Value::String(prompt)) => vec![prompt.as_str()],
      Some(Value::Array(prompts)) => prompts.iter().filter_map(Value::as_str).collect(),
      _ => Vec::new(),
    }
  }

  fn login(&self, key: &str) -> Option<&str> {
    self
      .meta
      .parameters
      .get("auto_login")
      .and_then(|login| login.get(key))
      .and_then(Value::as_str)
  }

  fn prompt_patterns(&self) -> Result<Vec<Pattern>, LavaError> {
    self
      .prompts()
      .into_iter()
      .map(|p| Pattern::regex(p).map_err(|e| LavaError::job(format!("Invalid prompt '{p}': {e}"))))
      .collect()
  }
}

#[async_trait]
impl Action for AutoLoginAction {
  fn meta(&self) -> &ActionMeta {
    &self.meta
  }

  fn meta_mut(&mut self) -> &mut ActionMeta {
    &mut self.meta
  }

  fn populate(&mut self, build: &BuildContext) -> Result<(), LavaError> {
    self.wait = build.connection_timeout();
    Ok(())
  }

  fn validate(&mut self) -> Vec<String> {
    let mut errors = Vec::new();
    if self.prompts().is_empty() {
      errors.push("Unable to identify boot prompts from job definition.".to_string());
    }
    if let Err(e) = self.prompt_patterns() {
      errors.push(e.to_string());
    }
    if let Some(login) = self.meta.parameters.get("auto_login") {
      if !login.is_object() {
        errors.push("auto_login must be a mapping".to_string());
      } else {
        if self.login("login_prompt").is_none_or(str::is_empty) {
          errors.push("'login_prompt' is mandatory for auto_login".to_string());
        }
        if self.login("username").is_none() {
          errors.push("'username' is mandatory for auto_login".to_string());
        }
        if self.login("password_prompt").is_some() && self.login("password").is_none() {
          errors.push("'password' is mandatory if 'password_prompt' is used in auto_login".to_string());
        }
      }
    }
    errors
  }

  async fn run(&mut self, state: &mut JobState) -> Result<(), LavaError> {
    let budget = TimeoutBudget::new(self.meta.timeout());
    let cancel = state.cancel.clone();
    let prompts = self.prompt_patterns()?;
    let connection = state.connection()?;

    if let (Some(login_prompt), Some(username)) = (self.login("login_prompt"), self.login("username")) {
      connection
        .expect(&[Pattern::literal(login_prompt)], budget.cap(self.wait), &cancel)
        .await?;
      connection.send_line(username).await?;
      if let (Some(password_prompt), Some(password)) =
        (self.login("password_prompt"), self.login("password"))
      {
        connection
          .expect(&[Pattern::literal(password_prompt)], budget.cap(self.wait), &cancel)
          .await?;
        connection.send_line(password).await?;
      }
      info!(username, "logged_in");
    }

    let found = connection.expect(&prompts, budget.cap(self.wait), &cancel).await?;
    info!(prompt = %found.matched, "boot_prompt_matched");
    state
      .context
      .set(keys::prompts(), json!(self.prompts()), &self.meta.level);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use lava_config::Parameters;

  use super::*;

  fn action(parameters: Value) -> AutoLoginAction {
    let parameters: Parameters = parameters.as_object().cloned().unwrap();
    AutoLoginAction {
      meta: ActionMeta::new("auto-login-action", "", "").with_parameters(parameters),
      wait: Duration::from_secs(1),
    }
  }

  #[test]
  fn test_validate() {
    assert_eq!(
      action(json!({})).validate(),
      vec!["Unable to identify boot prompts from job definition."]
    );
    assert!(action(json!({"prompts": ["root@debian:~#"]})).validate().is_empty());
    assert_eq!(
      action(json!({"prompts": "# ", "auto_login": {"login_prompt": "login:"}})).validate(),
      vec!["'username' is mandatory for auto_login"]
    );
    assert_eq!(
      action(json!({"prompts": ["("]})).validate().len(),
      1
    );
  }
}
