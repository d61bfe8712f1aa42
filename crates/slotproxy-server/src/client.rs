//! `call` subcommand: send one payload through a running proxy and save the
//! relayed chunks.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Args;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use slotproxy::transport::http::{ErrorBody, WireEvent};

#[derive(Debug, Clone, Args)]
pub struct CallArgs {
    /// Proxy base URL
    #[arg(long, env = "SLOTPROXY_URL", default_value = "http://localhost:1234")]
    pub url: String,

    /// Request payload, sent as-is
    #[arg(long, conflicts_with = "input", required_unless_present = "input")]
    pub payload: Option<String>,

    /// File whose contents are the request payload
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Where to write the response
    #[arg(long, short)]
    pub output: PathBuf,

    /// Write chunk N to `<output>.N` instead of concatenating
    #[arg(long)]
    pub split: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CallSummary {
    pub chunks: usize,
    pub bytes: usize,
}

fn chunk_path(output: &Path, index: usize) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

struct ChunkWriter {
    output: PathBuf,
    split: bool,
    joined: Option<tokio::fs::File>,
    summary: CallSummary,
}

impl ChunkWriter {
    async fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        if self.split {
            let path = chunk_path(&self.output, self.summary.chunks);
            tokio::fs::write(&path, chunk)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        } else {
            if self.joined.is_none() {
                let file = tokio::fs::File::create(&self.output)
                    .await
                    .with_context(|| format!("creating {}", self.output.display()))?;
                self.joined = Some(file);
            }
            if let Some(file) = self.joined.as_mut() {
                file.write_all(chunk).await?;
            }
        }
        self.summary.chunks += 1;
        self.summary.bytes += chunk.len();
        Ok(())
    }

    async fn finish(mut self) -> anyhow::Result<CallSummary> {
        match self.joined.take() {
            Some(mut file) => file.flush().await?,
            // An empty response still leaves an (empty) output file behind.
            None if !self.split => {
                tokio::fs::File::create(&self.output)
                    .await
                    .with_context(|| format!("creating {}", self.output.display()))?;
            }
            None => {}
        }
        Ok(self.summary)
    }
}

pub async fn run(args: CallArgs) -> anyhow::Result<CallSummary> {
    let payload = match (&args.payload, &args.input) {
        (Some(payload), _) => payload.clone().into_bytes(),
        (None, Some(input)) => tokio::fs::read(input)
            .await
            .with_context(|| format!("reading {}", input.display()))?,
        (None, None) => bail!("either --payload or --input is required"),
    };

    let url = format!("{}/process", args.url.trim_end_matches('/'));
    tracing::info!(%url, bytes = payload.len(), "Sending request");

    let response = reqwest::Client::new()
        .post(&url)
        .body(payload)
        .send()
        .await
        .with_context(|| format!("calling {url}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(error) => bail!("proxy returned {status} ({}): {}", error.code, error.message),
            Err(_) => bail!("proxy returned {status}: {body}"),
        }
    }

    let mut writer = ChunkWriter {
        output: args.output,
        split: args.split,
        joined: None,
        summary: CallSummary::default(),
    };

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut terminal = None;
    'read: while let Some(bytes) = stream.next().await {
        buffer.extend_from_slice(&bytes.context("reading response stream")?);
        while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=end).collect();
            let event = WireEvent::parse_line(&line[..end])?;
            if let Some(chunk) = event.decode_chunk()? {
                tracing::debug!(bytes = chunk.len(), "Result chunk");
                writer.write(&chunk).await?;
            } else {
                terminal = Some(event);
                break 'read;
            }
        }
    }

    let summary = writer.finish().await?;
    match terminal {
        Some(WireEvent::Completed) => {
            tracing::info!(chunks = summary.chunks, bytes = summary.bytes, "Response saved");
            Ok(summary)
        }
        Some(WireEvent::Error { code, message }) => {
            bail!("request failed after {} chunks ({code}): {message}", summary.chunks)
        }
        Some(WireEvent::Chunk { .. }) | None => {
            bail!("response ended without a terminal event")
        }
    }
}
