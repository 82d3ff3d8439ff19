//! Batch transcription over a bounded worker pool.
//!
//! Independent audio arrays (batch jobs, VAD-derived chunks of one long
//! file) decode concurrently — each worker owns its `DecodingInputs`, so no
//! cross-chunk state is shared. Completion order is unordered; the returned
//! list is re-sorted by chunk index.

use crossbeam_channel::unbounded;
use tracing::{debug, info};

use crate::error::{Result, SottoError};
use crate::options::DecodingOptions;
use crate::progress::CancellationToken;
use crate::transcribe::{TranscriptionResult, Transcriber};

/// Hard ceiling on derived worker counts.
const MAX_DEFAULT_WORKERS: usize = 8;

impl Transcriber {
    /// Transcribe a batch of independent audio arrays concurrently.
    ///
    /// Results are returned in input order regardless of completion order.
    /// The first chunk error fails the whole batch; cancellation wins over
    /// later-arriving errors.
    pub fn transcribe_batch(
        &self,
        audio_arrays: &[&[f32]],
        options: &DecodingOptions,
        cancellation: &CancellationToken,
    ) -> Result<Vec<TranscriptionResult>> {
        options.validate()?;
        if audio_arrays.is_empty() {
            return Ok(Vec::new());
        }

        let worker_count = worker_count(options, audio_arrays.len());
        info!(
            chunks = audio_arrays.len(),
            workers = worker_count,
            "starting batch transcription"
        );

        let (job_tx, job_rx) = unbounded::<(usize, &[f32])>();
        for (index, audio) in audio_arrays.iter().enumerate() {
            let _ = job_tx.send((index, audio));
        }
        drop(job_tx);

        let (result_tx, result_rx) = unbounded::<(usize, Result<TranscriptionResult>)>();
        let mut slots: Vec<Option<Result<TranscriptionResult>>> =
            (0..audio_arrays.len()).map(|_| None).collect();

        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok((index, audio)) = job_rx.recv() {
                        let result = self.transcribe_with(audio, options, None, cancellation);
                        debug!(chunk = index, ok = result.is_ok(), "batch chunk finished");
                        if result_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            while let Ok((index, result)) = result_rx.recv() {
                slots[index] = Some(result);
            }
        });

        let mut ordered = Vec::with_capacity(slots.len());
        let mut first_error: Option<SottoError> = None;
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(Ok(result)) => ordered.push(result),
                Some(Err(e)) if e.is_cancelled() => return Err(e),
                Some(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                None => {
                    if first_error.is_none() {
                        first_error = Some(SottoError::Model(format!(
                            "batch chunk {index} produced no result"
                        )));
                    }
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(ordered),
        }
    }
}

fn worker_count(options: &DecodingOptions, chunk_count: usize) -> usize {
    let configured = if options.concurrent_worker_count > 0 {
        options.concurrent_worker_count
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .clamp(1, MAX_DEFAULT_WORKERS)
    };
    configured.min(chunk_count).max(1)
}
