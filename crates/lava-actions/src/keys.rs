//! Namespace data passed between actions.

use lava_pipeline::{Context, DataKey, LavaError};
use lava_testdef::{TestDefinition, TestSource};
use serde_json::{Value, json};

/// Local path of a downloaded image, by its label in the deploy block.
pub fn downloaded_file(label: &str) -> DataKey {
  DataKey::common("download-action", label, "file")
}

pub fn downloaded_sha256(label: &str) -> DataKey {
  DataKey::common("download-action", label, "sha256")
}

/// Host directory holding the overlay.
pub fn overlay_dir() -> DataKey {
  DataKey::common("lava-overlay", "output", "location")
}

pub fn overlay_tarball() -> DataKey {
  DataKey::common("compress-overlay", "output", "file")
}

/// Extracted NFS root, or the server export for persistent NFS.
pub fn nfs_root() -> DataKey {
  DataKey::common("extract-nfsrootfs", "nfsroot", "path")
}

pub fn persistent_nfs() -> DataKey {
  DataKey::common("extract-nfsrootfs", "nfsroot", "persistent")
}

/// Variables exported in the test shell before the runner starts.
pub fn environment() -> DataKey {
  DataKey::common("deploy-device-env", "environment", "env")
}

/// Shell prompts seen once the target has booted.
pub fn prompts() -> DataKey {
  DataKey::common("auto-login-action", "prompts", "list")
}

fn test_definition(run_id: &str) -> DataKey {
  DataKey::common("test-definition", run_id, "definition")
}

/// Record a loaded definition for the overlay and test shell actions.
pub fn store_definition(ctx: &mut Context, testdef: &TestDefinition, writer: &str) {
  ctx.set(
    test_definition(&testdef.run_id),
    json!({
      "index": testdef.index,
      "name": testdef.name,
      "source": testdef.source,
      "document": testdef.document,
    }),
    writer,
  );
}

/// A definition stored by [`store_definition`].
pub fn stored_definition(ctx: &Context, run_id: &str) -> Result<TestDefinition, LavaError> {
  let key = test_definition(run_id);
  let stored = ctx
    .get(&key)
    .ok_or_else(|| LavaError::infrastructure(format!("test definition {run_id} was not deployed")))?;
  let index = stored.get("index").and_then(Value::as_u64).unwrap_or_default() as usize;
  let name = stored.get("name").and_then(Value::as_str).unwrap_or_default();
  let document = stored.get("document").cloned().unwrap_or(Value::Null);
  let source = match stored.get("source") {
    Some(source) => serde_json::from_value::<TestSource>(source.clone()).map_err(|e| {
      LavaError::infrastructure(format!("test definition {run_id} has a bad source: {e}"))
    })?,
    None => TestSource::Inline,
  };
  Ok(TestDefinition::new(index, name, source, document))
}

#[cfg(test)]
mod tests {
  use lava_testdef::Vcs;

  use super::*;

  #[test]
  fn test_definition_round_trip() {
    let mut ctx = Context::new();
    let def = TestDefinition::new(2, "smoke", TestSource::Inline, json!({"run": {"steps": ["true"]}}));
    store_definition(&mut ctx, &def, "1.2.1");

    let back = stored_definition(&ctx, "2_smoke").unwrap();
    assert_eq!(back.run_id, "2_smoke");
    assert_eq!(back.run_steps(), vec!["true"]);
    assert!(matches!(
      stored_definition(&ctx, "0_missing"),
      Err(LavaError::Infrastructure { .. })
    ));
  }

  #[test]
  fn test_stored_definition_keeps_repository_source() {
    let mut ctx = Context::new();
    let source = TestSource::Repo {
      vcs: Vcs::Git,
      repository: "https://example.com/tests.git".to_string(),
      revision: Some("v1.2".to_string()),
      commit: Some("5d1e7a".to_string()),
      path: "smoke.yaml".to_string(),
      checkout: "/var/lib/lava/tmp/1/testdefs/0_smoke/git-0".into(),
    };
    let def = TestDefinition::new(0, "smoke", source.clone(), json!({"run": {"steps": []}}));
    store_definition(&mut ctx, &def, "1.3.1");

    let back = stored_definition(&ctx, "0_smoke").unwrap();
    assert_eq!(back.source, source);
    assert_eq!(back.source.kind(), "git");
    assert_eq!(back.software_source().unwrap().branch_revision, "5d1e7a");
  }
}
