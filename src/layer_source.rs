// src/layer_source.rs - Job parameters and per-layer image bytes for the sequencer
use resin_shared::{LayerImage, PrintParameters};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

use crate::config::SequencerConfig;
use crate::file::{JobPackage, PackageError};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Error)]
pub enum LayerSourceError {
    #[error("Failed to read job package: {0}")]
    Package(#[from] PackageError),
    #[error("Layer {index} image could not be loaded after {attempts} attempts: {reason}")]
    ImageLoad { index: usize, attempts: u32, reason: String },
    #[error("Background read failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Blocking access to a packaged job. Called from blocking worker threads.
pub trait LayerArchive: Send + Sync {
    fn parameters(&self) -> Result<PrintParameters, PackageError>;
    fn layer_count(&self) -> usize;
    fn layer_image(&self, index: usize) -> Result<Vec<u8>, PackageError>;
}

impl LayerArchive for JobPackage {
    fn parameters(&self) -> Result<PrintParameters, PackageError> {
        JobPackage::parameters(self)
    }

    fn layer_count(&self) -> usize {
        JobPackage::layer_count(self)
    }

    fn layer_image(&self, index: usize) -> Result<Vec<u8>, PackageError> {
        JobPackage::layer_image(self, index)
    }
}

/// Retry policy for layer reads.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, delay: Duration::from_millis(500) }
    }
}

impl From<&SequencerConfig> for RetryPolicy {
    fn from(config: &SequencerConfig) -> Self {
        Self {
            attempts: config.image_attempts.max(1),
            delay: Duration::from_millis(config.image_retry_delay_ms),
        }
    }
}

/// Reference to the job being printed. Cheap to clone.
#[derive(Clone)]
pub struct LayerSource {
    archive: Arc<dyn LayerArchive>,
    retry: RetryPolicy,
}

impl LayerSource {
    pub fn new(archive: Arc<dyn LayerArchive>) -> Self {
        Self { archive, retry: RetryPolicy::default() }
    }

    pub fn open(path: &str) -> Result<Self, LayerSourceError> {
        Ok(Self::new(Arc::new(JobPackage::open(path)?)))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn parameters(&self) -> Result<PrintParameters, LayerSourceError> {
        let archive = self.archive.clone();
        let params = tokio::task::spawn_blocking(move || archive.parameters()).await??;
        Ok(params)
    }

    pub fn layer_count(&self) -> usize {
        self.archive.layer_count()
    }

    /// Reads one layer, retrying read and decode failures. Exhausting the
    /// retries is permanent for this call.
    pub async fn layer_image(&self, index: usize) -> Result<LayerImage, LayerSourceError> {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let archive = self.archive.clone();
            let result = tokio::task::spawn_blocking(move || archive.layer_image(index)).await?;
            match result.map_err(|e| e.to_string()).and_then(check_png) {
                Ok(data) => return Ok(LayerImage { index, data }),
                Err(reason) => {
                    tracing::warn!("Layer {} load attempt {}/{} failed: {}", index, attempt, attempts, reason);
                    last_error = reason;
                    if attempt < attempts {
                        sleep(self.retry.delay).await;
                    }
                }
            }
        }

        tracing::error!("Layer {} image unavailable: {}", index, last_error);
        Err(LayerSourceError::ImageLoad { index, attempts, reason: last_error })
    }
}

fn check_png(data: Vec<u8>) -> Result<Vec<u8>, String> {
    if data.starts_with(&PNG_SIGNATURE) {
        Ok(data)
    } else {
        Err(format!("not a PNG image ({} bytes)", data.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyArchive {
        failures: usize,
        calls: AtomicUsize,
    }

    impl LayerArchive for FlakyArchive {
        fn parameters(&self) -> Result<PrintParameters, PackageError> {
            Ok(PrintParameters { total_layers: 1, ..PrintParameters::default() })
        }

        fn layer_count(&self) -> usize {
            1
        }

        fn layer_image(&self, _index: usize) -> Result<Vec<u8>, PackageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(PackageError::Invalid("truncated entry".to_string()))
            } else {
                let mut data = PNG_SIGNATURE.to_vec();
                data.extend_from_slice(b"IHDR");
                Ok(data)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_layer_image_recovers_within_retries() {
        let archive = Arc::new(FlakyArchive { failures: 2, calls: AtomicUsize::new(0) });
        let source = LayerSource::new(archive.clone());
        let image = source.layer_image(0).await.unwrap();
        assert_eq!(image.index, 0);
        assert_eq!(archive.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_layer_image_gives_up_after_retries() {
        let archive = Arc::new(FlakyArchive { failures: 5, calls: AtomicUsize::new(0) });
        let source = LayerSource::new(archive.clone());
        let err = source.layer_image(4).await.unwrap_err();
        assert!(matches!(err, LayerSourceError::ImageLoad { index: 4, attempts: 3, .. }));
        assert_eq!(archive.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_check_png_rejects_other_bytes() {
        assert!(check_png(b"GIF89a".to_vec()).is_err());
        assert!(check_png(PNG_SIGNATURE.to_vec()).is_ok());
    }
}
