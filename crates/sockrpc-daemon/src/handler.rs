//! Request handlers for the daemon.

use async_trait::async_trait;
use sockrpc_ipc::codec::TERMINATOR;
use sockrpc_ipc::{Connection, IpcError, RequestHandler};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::HandlerConfig;

/// Build the handler selected by the configuration
pub fn build_handler(config: &HandlerConfig) -> Arc<dyn RequestHandler> {
    match config {
        HandlerConfig::Echo => Arc::new(EchoHandler),
        HandlerConfig::Exec { program, args } => Arc::new(ExecHandler::new(program, args)),
    }
}

/// Replies with the request
pub struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, conn: &mut Connection, request: Vec<u8>) -> Result<(), IpcError> {
        conn.write_frame(&request).await?;
        Ok(())
    }
}

/// Runs a program per request, in its own process.
///
/// The request is the program's stdin and its stdout is the reply. A program
/// that exits unsuccessfully gets no reply sent on its behalf.
pub struct ExecHandler {
    program: String,
    args: Vec<String>,
}

impl ExecHandler {
    pub fn new(program: impl Into<String>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
        }
    }
}

#[async_trait]
impl RequestHandler for ExecHandler {
    async fn handle(&self, conn: &mut Connection, request: Vec<u8>) -> Result<(), IpcError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IpcError::Handler(format!("failed to spawn {}: {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| IpcError::Handler("child stdin unavailable".to_string()))?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe
        let feeder = tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&request).await {
                tracing::debug!("Child stopped reading its input: {}", e);
            }
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| IpcError::Handler(format!("waiting for {}: {}", self.program, e)))?;
        let _ = feeder.await;

        if !output.status.success() {
            return Err(IpcError::Handler(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        let reply = match output.stdout.iter().position(|&b| b == TERMINATOR) {
            Some(end) => {
                tracing::warn!(
                    connection = %conn.id(),
                    "Reply contains a zero byte, truncating at offset {}",
                    end
                );
                &output.stdout[..end]
            }
            None => &output.stdout[..],
        };

        conn.write_frame(reply).await?;
        Ok(())
    }
}
