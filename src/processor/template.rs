//! `{name}` substitution for command processor arguments.

use std::collections::HashMap;
use std::path::Path;

use ingestd_common::ArtifactId;

/// Variables available to a command processor's arguments and output names.
///
/// # Example
///
/// ```
/// use ingestd::processor::TemplateContext;
/// use ingestd_common::ArtifactId;
/// use std::path::Path;
///
/// let ctx = TemplateContext::for_job(
///     Path::new("/srv/files/42"),
///     Path::new("/var/work/42"),
///     ArtifactId::new(42),
/// );
///
/// assert_eq!(ctx.substitute("{working_dir}/thumb.jpg"), "/var/work/42/thumb.jpg");
/// assert_eq!(ctx.substitute("render-{id}.mp4"), "render-42.mp4");
/// ```
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables for one job: `{input}`, `{working_dir}` and `{id}`.
    pub fn for_job(input: &Path, working_dir: &Path, id: ArtifactId) -> Self {
        Self::new()
            .with_var("input", &input.display().to_string())
            .with_var("working_dir", &working_dir.display().to_string())
            .with_var("id", &id.to_string())
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }

    /// Replace every known `{key}`; unknown placeholders are left as-is.
    pub fn substitute(&self, template: &str) -> String {
        let mut result = template.to_string();
        for (key, value) in &self.vars {
            result = result.replace(&format!("{{{key}}}"), value);
        }
        result
    }

    pub fn substitute_all(&self, templates: &[String]) -> Vec<String> {
        templates.iter().map(|t| self.substitute(t)).collect()
    }
}
