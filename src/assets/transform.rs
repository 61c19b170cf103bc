//! Format-specific transforms applied to fetched asset bytes before hashing.
//!
//! A transform is a blocking bytes-in/bytes-out step. The shipped implementation pipes
//! the bytes through an external program (stdin to stdout), e.g. an image optimizer or
//! a video re-encoder configured by the user.

use serde::Deserialize;
use std::fmt::Debug;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Cannot start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed ({status}): {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{tool} produced no output")]
    EmptyOutput { tool: String },

    #[error("{tool} timed out after {secs}s")]
    TimedOut { tool: String, secs: u64 },

    #[error("{tool} crashed: {reason}")]
    Crashed { tool: String, reason: String },
}

/// Result of a transform: new bytes and, when it changed, the new content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// A blocking asset transform. Runs on the blocking thread pool under the tool permit.
pub trait AssetTransform: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Whether this transform handles an asset with this URL and declared type.
    fn applies_to(&self, url: &str, content_type: Option<&str>) -> bool;

    fn transform(&self, input: Vec<u8>) -> Result<Transformed, TransformError>;
}

/// Config-file description of an external tool.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransformSpec {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Content types (e.g. `image/png`) the tool applies to.
    pub content_types: Vec<String>,
    /// URL file extensions (without dot) the tool applies to.
    pub extensions: Vec<String>,
    /// Content type of the tool's output, when different from its input.
    pub output_content_type: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Pipes asset bytes through an external program.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    name: String,
    program: String,
    args: Vec<String>,
    content_types: Vec<String>,
    extensions: Vec<String>,
    output_content_type: Option<String>,
    timeout: Duration,
}

impl ExternalTool {
    /// Returns None when no program is configured.
    pub fn from_spec(spec: &TransformSpec) -> Option<Self> {
        let (program, args) = spec.command.split_first()?;
        let name = if spec.name.is_empty() {
            program.clone()
        } else {
            spec.name.clone()
        };
        Some(Self {
            name,
            program: program.clone(),
            args: args.to_vec(),
            content_types: spec
                .content_types
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            extensions: spec
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            output_content_type: spec.output_content_type.clone(),
            timeout: Duration::from_secs(spec.timeout_secs.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)),
        })
    }

    fn io_error(&self, source: std::io::Error) -> TransformError {
        TransformError::Io {
            tool: self.name.clone(),
            source,
        }
    }
}

impl AssetTransform for ExternalTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, url: &str, content_type: Option<&str>) -> bool {
        if let Some(ct) = content_type {
            if self.content_types.iter().any(|t| t == ct) {
                return true;
            }
        }
        let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
        path.rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| self.extensions.contains(&ext.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    fn transform(&self, input: Vec<u8>) -> Result<Transformed, TransformError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TransformError::Spawn {
                tool: self.name.clone(),
                source,
            })?;
        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            return Err(self.io_error(std::io::Error::other("missing stdio pipe")));
        };

        let started = Instant::now();
        let (status, output, errors) = std::thread::scope(|scope| {
            // Feed and drain on separate threads so neither pipe can fill up and block.
            let writer = scope.spawn(move || {
                let written = stdin.write_all(&input);
                drop(stdin);
                written
            });
            let reader = scope.spawn(move || {
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).map(|_| buf)
            });
            let err_reader = scope.spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            });

            let status = loop {
                match child.try_wait() {
                    Ok(Some(status)) => break Ok(status),
                    Ok(None) if started.elapsed() >= self.timeout => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break Err(TransformError::TimedOut {
                            tool: self.name.clone(),
                            secs: self.timeout.as_secs(),
                        });
                    }
                    Ok(None) => std::thread::sleep(POLL_INTERVAL),
                    Err(e) => break Err(self.io_error(e)),
                }
            };
            // A tool may exit without reading all of its input; that is not an error by itself.
            let _ = writer.join();
            let output = reader.join();
            let errors = err_reader.join().unwrap_or_default();
            (status, output, errors)
        });

        let status = status?;
        let bytes = match output {
            Ok(read) => read.map_err(|e| self.io_error(e))?,
            Err(_) => {
                return Err(TransformError::Crashed {
                    tool: self.name.clone(),
                    reason: "output reader panicked".to_string(),
                })
            }
        };
        if !status.success() {
            return Err(TransformError::Failed {
                tool: self.name.clone(),
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&errors).trim().to_string(),
            });
        }
        if bytes.is_empty() {
            return Err(TransformError::EmptyOutput {
                tool: self.name.clone(),
            });
        }
        debug!(tool = %self.name, bytes = bytes.len(), "transformed");
        Ok(Transformed {
            bytes,
            content_type: self.output_content_type.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &[&str]) -> TransformSpec {
        TransformSpec {
            name: "test-tool".into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            content_types: vec!["image/png".into()],
            extensions: vec![".gif".into()],
            output_content_type: Some("image/webp".into()),
            timeout_secs: Some(10),
        }
    }

    #[test]
    fn matches_by_type_or_extension() {
        let tool = ExternalTool::from_spec(&spec(&["cat"])).expect("tool");
        assert!(tool.applies_to("https://x/a.bin", Some("image/png")));
        assert!(tool.applies_to("https://x/A.GIF?v=2", None));
        assert!(!tool.applies_to("https://x/a.jpg", Some("image/jpeg")));
        assert!(ExternalTool::from_spec(&TransformSpec::default()).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn pipes_bytes_through_the_program() -> Result<(), TransformError> {
        let tool = ExternalTool::from_spec(&spec(&["cat"])).expect("tool");
        let out = tool.transform(b"pixels".to_vec())?;
        assert_eq!(out.bytes, b"pixels");
        assert_eq!(out.content_type.as_deref(), Some("image/webp"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failing_program_is_reported() {
        let tool = ExternalTool::from_spec(&spec(&["sh", "-c", "echo broken >&2; exit 3"])).expect("tool");
        match tool.transform(b"x".to_vec()) {
            Err(TransformError::Failed { stderr, .. }) => assert_eq!(stderr, "broken"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let tool = ExternalTool::from_spec(&spec(&["/nonexistent/mindtouch-zim-tool"])).expect("tool");
        assert!(matches!(
            tool.transform(b"x".to_vec()),
            Err(TransformError::Spawn { .. })
        ));
    }
}
