//! Ordered batch embedding over a provider.
//!
//! Splits an input list into provider-sized chunks, runs a bounded window
//! of chunk requests concurrently, and reassembles the results in input
//! order. The window size, chunk size, and inter-window delay come from
//! the provider's [`ProviderTuning`].

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::embedding::{EmbeddingProvider, EmbeddingVector};
use crate::tuning::ProviderTuning;

/// Embed `texts` in order, honoring the provider's tuning.
///
/// Guarantees on success: exactly one vector per input, in input order,
/// all with the same dimension. A missing vector or a dimension drift in
/// any response fails the whole batch; partial results are never returned.
pub async fn embed_batch(
    provider: Arc<dyn EmbeddingProvider>,
    texts: &[String],
    tuning: ProviderTuning,
) -> Result<Vec<EmbeddingVector>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let prepared: Vec<String> = texts.iter().map(|t| provider.preprocess(t)).collect();
    let chunks: Vec<Vec<String>> = prepared
        .chunks(tuning.chunk_size.max(1))
        .map(|c| c.to_vec())
        .collect();

    debug!(
        provider = provider.provider_name(),
        texts = texts.len(),
        chunks = chunks.len(),
        window = tuning.concurrent_requests,
        "embedding batch"
    );

    let mut results: Vec<EmbeddingVector> = Vec::with_capacity(texts.len());
    let mut expected_dimension: Option<usize> = None;

    let window = tuning.concurrent_requests.max(1);
    let total_windows = chunks.len().div_ceil(window);

    for (window_idx, window_chunks) in chunks.chunks(window).enumerate() {
        let mut handles = Vec::with_capacity(window_chunks.len());
        for chunk in window_chunks {
            let provider = Arc::clone(&provider);
            let chunk = chunk.clone();
            handles.push(tokio::spawn(async move {
                provider.embed_chunk(&chunk).await
            }));
        }

        // Await in spawn order so the output stays aligned with the input.
        for handle in handles {
            let vectors = handle
                .await
                .context("embedding task panicked")??;
            for vector in vectors {
                match expected_dimension {
                    None => expected_dimension = Some(vector.dimension),
                    Some(expected) if expected != vector.dimension => bail!(
                        "Embedding dimension drifted mid-batch: expected {}, got {}",
                        expected,
                        vector.dimension
                    ),
                    Some(_) => {}
                }
                results.push(vector);
            }
        }

        if window_idx + 1 < total_windows && !tuning.batch_delay.is_zero() {
            tokio::time::sleep(tuning.batch_delay).await;
        }
    }

    if results.len() != texts.len() {
        bail!(
            "Embedding batch produced {} vectors for {} inputs",
            results.len(),
            texts.len()
        );
    }

    Ok(results)
}
