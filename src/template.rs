//! Template expansion and Markdown conversion.

use comrak::Options;
use minijinja::Environment;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("template rendering failed for {target}: {source}")]
pub struct TemplateError {
    target: String,
    #[source]
    source: minijinja::Error,
}

/// Expands a document template against zero, one or many data rows.
pub struct TemplateStage {
    env: Environment<'static>,
}

impl TemplateStage {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| minijinja::AutoEscape::None);
        Self { env }
    }

    /// Renders `template` once per row and concatenates the results in row
    /// order, or once with an empty context when `rows` is empty.
    pub fn expand(&self, template: &str, rows: &[Value]) -> Result<String, TemplateError> {
        if rows.is_empty() {
            return self
                .env
                .render_str(template, minijinja::context! {})
                .map_err(|source| TemplateError {
                    target: "document".to_string(),
                    source,
                });
        }

        let mut combined = String::new();
        for (index, row) in rows.iter().enumerate() {
            let rendered = self
                .env
                .render_str(template, row)
                .map_err(|source| TemplateError {
                    target: format!("data row {index}"),
                    source,
                })?;
            combined.push_str(&rendered);
        }
        Ok(combined)
    }
}

impl Default for TemplateStage {
    fn default() -> Self {
        Self::new()
    }
}

fn markdown_options() -> Options<'static> {
    let mut options = Options::default();
    options.extension.autolink = true;
    options.extension.table = true;
    options.extension.strikethrough = true;
    options.parse.smart = true;
    options.render.r#unsafe = true;
    options
}

/// Converts Markdown to HTML. Raw HTML and template tags pass through.
pub fn markdown_to_html(markdown: &str) -> String {
    comrak::markdown_to_html(markdown, &markdown_options())
}
