//! Descriptor extraction through an external model process.
//!
//! The configured command receives the encoded image on stdin and prints
//! `{"faces": [[f32, ...], ...]}` on stdout, one descriptor per detected face.
//! The child is killed if the request is dropped (e.g. on timeout).

use facegate_core::{Descriptor, DescriptorExtractor, ExtractError, FaceImage};
use serde::Deserialize;
use std::future::Future;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Deserialize)]
struct ExtractorOutput {
    faces: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    /// Build from a command line; `None` when it is empty.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

fn interpret(stdout: &[u8]) -> Result<Descriptor, ExtractError> {
    let output: ExtractorOutput =
        serde_json::from_slice(stdout).map_err(|e| ExtractError::Malformed(e.to_string()))?;
    let mut faces = output.faces.into_iter();
    match (faces.next(), faces.next()) {
        (None, _) => Err(ExtractError::NoFaceDetected),
        (Some(_), Some(_)) => Err(ExtractError::MultipleFacesDetected),
        (Some(values), None) => Ok(Descriptor::new(values)),
    }
}

impl DescriptorExtractor for CommandExtractor {
    fn extract(
        &self,
        image: &FaceImage,
    ) -> impl Future<Output = Result<Descriptor, ExtractError>> + Send {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let bytes = image.bytes().to_vec();
        let (width, height) = (image.width(), image.height());
        let program = self.program.clone();

        async move {
            let mut child = command
                .spawn()
                .map_err(|e| ExtractError::Unavailable(format!("spawn {program}: {e}")))?;
            tracing::debug!(program = %program, width, height, "extractor started");

            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| ExtractError::Unavailable("extractor stdin not captured".into()))?;
            let feed = async move {
                let result = stdin.write_all(&bytes).await;
                drop(stdin);
                result
            };
            let (fed, output) = tokio::join!(feed, child.wait_with_output());

            let output =
                output.map_err(|e| ExtractError::Unavailable(format!("wait for {program}: {e}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(ExtractError::Unavailable(format!(
                    "{program} exited with {}: {}",
                    output.status,
                    stderr.trim()
                )));
            }
            if let Err(err) = fed {
                // The child may legitimately stop reading early once it has an answer.
                tracing::debug!(error = %err, "extractor closed stdin early");
            }
            interpret(&output.stdout)
        }
    }
}
