//! Tamper hook backed by an external executable.
//!
//! The script receives the outgoing request args as JSON on stdin and
//! writes the (possibly rewritten) args back as JSON on stdout. Anything
//! that can read and write JSON works: a Python one-liner, jq, a compiled
//! helper.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use xtractor::{AttackContext, Error, RequestArgs, Tamper};

pub struct ScriptTamper {
    path: PathBuf,
}

impl ScriptTamper {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Tamper for ScriptTamper {
    async fn tamper(
        &self,
        _context: &AttackContext,
        args: &mut RequestArgs,
    ) -> xtractor::Result<()> {
        let input =
            serde_json::to_vec(args).map_err(|error| Error::Tamper(error.to_string()))?;

        let mut child = tokio::process::Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|error| {
                Error::Tamper(format!("failed to run {}: {}", self.path.display(), error))
            })?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(&input)
                .await
                .map_err(|error| Error::Tamper(error.to_string()))?;
        }
        drop(child.stdin.take());

        let output = child
            .wait_with_output()
            .await
            .map_err(|error| Error::Tamper(error.to_string()))?;
        if !output.status.success() {
            return Err(Error::Tamper(format!(
                "{} exited with {}",
                self.path.display(),
                output.status
            )));
        }

        *args = serde_json::from_slice(&output.stdout).map_err(|error| {
            Error::Tamper(format!("script produced invalid args: {}", error))
        })?;
        Ok(())
    }
}
