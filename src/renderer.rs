//! HTML to PDF conversion through external rendering engines.

use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::job::Engine;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to start {engine}: {source}")]
    Spawn {
        engine: Engine,
        #[source]
        source: io::Error,
    },

    #[error("{engine} exited with {status}: {stderr}")]
    Failed {
        engine: Engine,
        status: String,
        stderr: String,
    },

    #[error("{engine} produced no output")]
    EmptyOutput { engine: Engine },

    #[error("{engine} did not finish within {}s", .after.as_secs())]
    Timeout { engine: Engine, after: Duration },

    #[error("render workspace error: {0}")]
    Io(#[from] io::Error),
}

/// Converts a composed HTML document into PDF bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, html: &str, engine: Engine) -> Result<Vec<u8>, RenderError>;
}

/// Runs each engine's command line tool in a scratch directory.
///
/// - `weasyprint`: `python3 -m weasyprint - -`, HTML on stdin, PDF on stdout
/// - `pagedjs`: `pagedjs-cli <in.html> -o <out.pdf>`
/// - `vivliostyle`: `vivliostyle build <in.html> -o <out.pdf>`
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    timeout: Duration,
}

impl CommandRenderer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(engine: Engine, input: &Path, output: &Path) -> Command {
        let mut command = match engine {
            Engine::WeasyPrint => {
                let mut command = Command::new("python3");
                command.args(["-m", "weasyprint", "-", "-"]);
                command
            }
            Engine::PagedJs => {
                let mut command = Command::new("pagedjs-cli");
                command.arg(input).arg("-o").arg(output);
                command
            }
            Engine::Vivliostyle => {
                let mut command = Command::new("vivliostyle");
                command.arg("build").arg(input).arg("-o").arg(output);
                command
            }
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, html: &str, engine: Engine) -> Result<Vec<u8>, RenderError> {
        let workspace = TempDir::new()?;
        let input = workspace.path().join("document.html");
        let output = workspace.path().join("document.pdf");
        tokio::fs::write(&input, html).await?;

        let mut child = Self::command(engine, &input, &output)
            .current_dir(workspace.path())
            .spawn()
            .map_err(|source| RenderError::Spawn { engine, source })?;

        if let Some(mut stdin) = child.stdin.take() {
            if engine == Engine::WeasyPrint {
                stdin.write_all(html.as_bytes()).await?;
            }
            drop(stdin);
        }

        let finished = child.wait_with_output().await?;
        if !finished.status.success() {
            return Err(RenderError::Failed {
                engine,
                status: finished.status.to_string(),
                stderr: String::from_utf8_lossy(&finished.stderr).trim().to_string(),
            });
        }

        let pdf = match engine {
            Engine::WeasyPrint => finished.stdout,
            Engine::PagedJs | Engine::Vivliostyle => match tokio::fs::read(&output).await {
                Ok(pdf) => pdf,
                Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(err) => return Err(err.into()),
            },
        };

        if pdf.is_empty() {
            return Err(RenderError::EmptyOutput { engine });
        }
        Ok(pdf)
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, html: &str, engine: Engine) -> Result<Vec<u8>, RenderError> {
        debug!("Rendering document: engine={}, html_bytes={}", engine, html.len());

        let pdf = tokio::time::timeout(self.timeout, self.run(html, engine))
            .await
            .map_err(|_| RenderError::Timeout {
                engine,
                after: self.timeout,
            })??;

        info!("PDF render complete: engine={}, {} bytes", engine, pdf.len());
        Ok(pdf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_command_lines() {
        let input = Path::new("/work/in.html");
        let output = Path::new("/work/out.pdf");

        let weasy = CommandRenderer::command(Engine::WeasyPrint, input, output);
        assert_eq!(weasy.as_std().get_program(), "python3");
        let args: Vec<_> = weasy.as_std().get_args().collect();
        assert_eq!(args, ["-m", "weasyprint", "-", "-"]);

        let paged = CommandRenderer::command(Engine::PagedJs, input, output);
        assert_eq!(paged.as_std().get_program(), "pagedjs-cli");
        let args: Vec<_> = paged.as_std().get_args().collect();
        assert_eq!(args, ["/work/in.html", "-o", "/work/out.pdf"]);

        let vivliostyle = CommandRenderer::command(Engine::Vivliostyle, input, output);
        let args: Vec<_> = vivliostyle.as_std().get_args().collect();
        assert_eq!(args, ["build", "/work/in.html", "-o", "/work/out.pdf"]);
    }

    #[test]
    fn test_error_messages_name_the_engine() {
        let err = RenderError::Timeout {
            engine: Engine::PagedJs,
            after: Duration::from_secs(120),
        };
        assert_eq!(err.to_string(), "pagedjs did not finish within 120s");

        let err = RenderError::EmptyOutput {
            engine: Engine::Vivliostyle,
        };
        assert_eq!(err.to_string(), "vivliostyle produced no output");
    }

    #[tokio::test]
    async fn test_mock_renderer_seam() {
        let mut renderer = MockRenderer::new();
        renderer
            .expect_render()
            .withf(|html, engine| html.contains("<p>") && *engine == Engine::PagedJs)
            .returning(|_, _| Ok(b"%PDF-1.7".to_vec()));

        let pdf = renderer.render("<p>x</p>", Engine::PagedJs).await.unwrap();
        assert_eq!(pdf, b"%PDF-1.7");
    }
}
