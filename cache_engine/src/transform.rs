//! Optional byte-transform pipeline applied between the remote stream and the
//! local file (spec.md §9 "External process pipeline for transforms"): a
//! `transform_cmd` is spawned as a subprocess, fed the raw remote bytes on
//! stdin, and its stdout is what gets written to the local cache file.
//! `transform_cmd` is tokenized shell-like (quoting honored) and run directly,
//! with no shell involved (spec.md §4.4 step 1).

use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A transform stage sits between the raw remote byte stream and the writer
/// that lands bytes on local disk.
#[allow(async_fn_in_trait)]
pub trait TransformStage: Send + Sync + 'static {
    /// Consumes `input`, returning a stream of the transformed bytes.
    async fn apply(
        &self,
        input: Box<dyn Stream<Item = Result<Bytes>> + Send + Unpin>,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Stream<Item = Result<Bytes>> + Send + Unpin>>;
}

/// The identity transform, used when a managed file carries no `transform_cmd`.
pub struct NoTransform;

impl TransformStage for NoTransform {
    async fn apply(
        &self,
        input: Box<dyn Stream<Item = Result<Bytes>> + Send + Unpin>,
        _cancel: CancellationToken,
    ) -> Result<Box<dyn Stream<Item = Result<Bytes>> + Send + Unpin>> {
        Ok(input)
    }
}

/// Pipes the byte stream through an external process's stdin/stdout.
pub struct ProcessTransform {
    command_line: String,
}

impl ProcessTransform {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let argv = shell_words::split(&self.command_line).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid transform command line: {e}"),
            )
        })?;
        let Some((program, args)) = argv.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "transform command line is empty",
            ));
        };
        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

impl TransformStage for ProcessTransform {
    async fn apply(
        &self,
        mut input: Box<dyn Stream<Item = Result<Bytes>> + Send + Unpin>,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Stream<Item = Result<Bytes>> + Send + Unpin>> {
        let mut child = self
            .spawn()
            .map_err(|e| Error::RequestFailed(format!("failed to spawn transform: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::RequestFailed("transform stdin unavailable".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::RequestFailed("transform stdout unavailable".to_string()))?;

        // Forwarder: pumps the remote stream into the subprocess's stdin.
        let forward_cancel = cancel.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = forward_cancel.cancelled() => break,
                    chunk = input.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                if stdin.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(_)) | None => break,
                        }
                    }
                }
            }
            let _ = stdin.shutdown().await;
            drop(stdin);
        });

        // Acceptor: reads the subprocess's stdout into fixed-size chunks and
        // re-exposes them as a Bytes stream.
        let accept_cancel = cancel.clone();
        let output_stream = async_stream::stream! {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    biased;
                    _ = accept_cancel.cancelled() => {
                        yield Err(Error::RequestFailed("cancelled".to_string()));
                        break;
                    }
                    read = stdout.read(&mut buf) => {
                        match read {
                            Ok(0) => break,
                            Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                            Err(e) => {
                                yield Err(Error::RequestFailed(format!("transform stdout read failed: {e}")));
                                break;
                            }
                        }
                    }
                }
            }
            let _ = forwarder.await;
            match child.wait().await {
                Ok(status) if !status.success() => {
                    yield Err(Error::RequestFailed(format!("transform exited with {status}")));
                }
                Err(e) => {
                    yield Err(Error::RequestFailed(format!("transform wait failed: {e}")));
                }
                _ => {}
            }
        };

        Ok(Box::new(Box::pin(output_stream)))
    }
}
