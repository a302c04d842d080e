//! Template registry for sub-template resolution.

use std::collections::HashMap;
use std::path::Path;

use tether_types::TemplateError;

use crate::model::Template;

/// Named collection of parsed templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Template>,
}

impl TemplateRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template, replacing any previous one with the same name.
    pub fn insert(&mut self, template: Template) {
        self.templates.insert(template.name.clone(), template);
    }

    /// Look up a template by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    /// Registered template names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    /// Number of registered templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Load every `*.yaml` / `*.yml` file in a directory.
    ///
    /// # Errors
    ///
    /// I/O failures and the first template that fails to parse.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, TemplateError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| TemplateError::Parse(format!("{}: {e}", dir.display())))?;
        let mut loaded = 0;
        for entry in entries {
            let entry = entry.map_err(|e| TemplateError::Parse(e.to_string()))?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                continue;
            }
            let template = Template::from_yaml_file(&path)?;
            tracing::debug!(template = %template.name, path = %path.display(), "template loaded");
            self.insert(template);
            loaded += 1;
        }
        Ok(loaded)
    }
}
