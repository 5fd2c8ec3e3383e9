//! Message text rendering.
//!
//! Message nodes are authored with `{{name}}`-style placeholders. Rendering
//! is total, like condition evaluation: a missing variable renders as an
//! empty string and a malformed template falls back to the raw text, so a
//! bad message node degrades to an ugly send instead of a stuck instance.

use std::collections::HashMap;

use minijinja::{Environment, UndefinedBehavior};
use tracing::warn;

/// Render a message template against the instance bindings.
pub fn render_text(template: &str, bindings: &HashMap<String, String>) -> String {
  let mut env = Environment::new();
  env.set_undefined_behavior(UndefinedBehavior::Lenient);

  let tmpl = match env.template_from_str(template) {
    Ok(tmpl) => tmpl,
    Err(e) => {
      warn!(error = %e, "message_template_invalid");
      return template.to_string();
    }
  };

  match tmpl.render(bindings) {
    Ok(rendered) => rendered,
    Err(e) => {
      warn!(error = %e, "message_render_failed");
      template.to_string()
    }
  }
}
