//! Device command templates, rendered with minijinja against values the
//! job collected so far (`{{ images.rootfs }}`, `{{ NFSROOTFS }}`).

use lava_pipeline::LavaError;
use minijinja::{Environment, Value};

pub fn render(action: &str, template: &str, context: &serde_json::Value) -> Result<String, LavaError> {
  let env = Environment::new();
  env
    .render_str(template, Value::from_serialize(context))
    .map_err(|e| LavaError::infrastructure(format!("{action}: cannot render '{template}': {e}")))
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_render_nested_values() {
    let rendered = render(
      "execute-qemu",
      "qemu-system-x86_64 -drive format=raw,file={{ images.rootfs }} -m {{ memory }}",
      &json!({"images": {"rootfs": "/tmp/rootfs.img"}, "memory": 1024}),
    )
    .unwrap();
    assert_eq!(rendered, "qemu-system-x86_64 -drive format=raw,file=/tmp/rootfs.img -m 1024");
  }

  #[test]
  fn test_render_error() {
    let err = render("bootloader-commands", "{{ unclosed", &json!({})).unwrap_err();
    assert!(err.to_string().contains("bootloader-commands"));
  }
}
