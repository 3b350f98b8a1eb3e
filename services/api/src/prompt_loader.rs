use anyhow::{Context, Result};
use lingua_core::instructions::{DEFAULT_TEMPLATE, InstructionSource, render_template};
use lingua_core::messages::StartSession;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Reads every `*.md` file in `dir_path`, keyed by file stem.
pub fn load_prompts(dir_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read prompts directory: {}", dir_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem for prompt file")?
                .to_string();

            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;

            prompts.insert(prompt_key, content);
        }
    }

    Ok(prompts)
}

/// Teaching-mode templates keyed by mode code.
pub struct PromptLibrary {
    templates: HashMap<String, String>,
}

impl PromptLibrary {
    pub fn new(templates: HashMap<String, String>) -> Self {
        Self { templates }
    }

    /// Loads the directory, or starts empty (built-in template only) when
    /// it does not exist.
    pub fn load_or_default(dir_path: &Path) -> Result<Self> {
        if !dir_path.exists() {
            tracing::warn!(dir = %dir_path.display(), "Prompts directory missing, using built-in template");
            return Ok(Self::new(HashMap::new()));
        }
        Ok(Self::new(load_prompts(dir_path)?))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }
}

impl InstructionSource for PromptLibrary {
    fn instructions(&self, start: &StartSession) -> String {
        let template = match self.templates.get(&start.teaching_mode) {
            Some(template) => template.as_str(),
            None => {
                tracing::debug!(mode = %start.teaching_mode, "No template for teaching mode, using built-in");
                DEFAULT_TEMPLATE
            }
        };
        render_template(template, start)
    }
}
