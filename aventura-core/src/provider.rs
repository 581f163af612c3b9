//! The model provider seam.
//!
//! Everything in the core talks to models through [`Provider`], so tests can
//! script responses with `testing::MockProvider` and production code uses the
//! `claude` client.

use async_trait::async_trait;
use claude::{ChunkStream, Claude, Request, Response};

/// A model backend offering one-shot completion and streamed completion with tools.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send a request and wait for the whole response.
    async fn complete(&self, request: Request) -> Result<Response, claude::Error>;

    /// Send a request and stream content, reasoning and tool-call deltas.
    ///
    /// The stream ends with a `StreamChunk::Done`. Tool-call argument deltas carry
    /// the index of the call they belong to and may interleave across indices.
    async fn stream_with_tools(&self, request: Request) -> Result<ChunkStream, claude::Error>;
}

#[async_trait]
impl Provider for Claude {
    async fn complete(&self, request: Request) -> Result<Response, claude::Error> {
        Claude::complete(self, request).await
    }

    async fn stream_with_tools(&self, request: Request) -> Result<ChunkStream, claude::Error> {
        Claude::stream(self, request).await
    }
}

/// Run a completion and return its text.
pub(crate) async fn complete_text(
    provider: &dyn Provider,
    request: Request,
) -> Result<String, claude::Error> {
    let response = provider.complete(request).await?;
    Ok(response.text())
}
