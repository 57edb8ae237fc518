use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::{BatchFailure, FailedItem};
use crate::identifiers::{Identifier, IdentifierSequence};
use crate::ClientError;

/// What a batch does when one of its chunks fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Stop dispatching, drop in-flight chunks and report immediately.
    FailFast,
    /// Run every chunk to completion and report all failures together.
    #[default]
    CollectAll,
}

/// Result of one chunk's round trip.
#[derive(Debug)]
pub enum TaskOutcome<I, T> {
    Succeeded { input: I, output: T },
    Failed { input: I, error: ClientError },
    /// Dropped in flight because a fail-fast batch stopped. It may have been applied.
    Cancelled { input: I },
    /// Never sent because a fail-fast batch stopped first.
    Skipped { input: I },
}

impl<I, T> TaskOutcome<I, T> {
    pub fn input(&self) -> &I {
        match self {
            Self::Succeeded { input, .. }
            | Self::Failed { input, .. }
            | Self::Cancelled { input }
            | Self::Skipped { input } => input,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Outcomes of a batch, in the order of its inputs.
#[derive(Debug)]
pub struct TasksSummary<I, T> {
    pub outcomes: Vec<TaskOutcome<I, T>>,
}

impl<I, T> TasksSummary<I, T> {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(TaskOutcome::is_success)
    }

    /// Outputs in input order if every chunk succeeded.
    ///
    /// Otherwise builds a [`BatchFailure`]: `describe_input` lists the items
    /// a chunk carried and `describe_output` the items a successful chunk
    /// produced.
    pub fn into_outputs<D, O>(
        self,
        describe_input: D,
        describe_output: O,
    ) -> Result<Vec<T>, ClientError>
    where
        D: Fn(&I) -> Vec<Value>,
        O: Fn(&I, &T) -> Vec<Value>,
    {
        if self.all_succeeded() {
            return Ok(self
                .outcomes
                .into_iter()
                .filter_map(|outcome| match outcome {
                    TaskOutcome::Succeeded { output, .. } => Some(output),
                    _ => None,
                })
                .collect());
        }

        let mut failure = BatchFailure::default();
        let cancelled = Arc::new(ClientError::Cancelled);
        for outcome in self.outcomes {
            match outcome {
                TaskOutcome::Succeeded { input, output } => {
                    failure.successful.extend(describe_output(&input, &output));
                }
                TaskOutcome::Failed { input, error } => {
                    record_failed_chunk(&mut failure, describe_input(&input), error);
                }
                TaskOutcome::Cancelled { input } => {
                    failure
                        .unknown
                        .extend(describe_input(&input).into_iter().map(|item| FailedItem {
                            item,
                            cause: Arc::clone(&cancelled),
                        }));
                }
                TaskOutcome::Skipped { input } => failure.skipped.extend(describe_input(&input)),
            }
        }
        Err(ClientError::Batch(Box::new(failure)))
    }
}

impl TasksSummary<IdentifierSequence, Vec<Value>> {
    /// Compound result for identifier batches whose chunks return resource items.
    pub fn into_items(self) -> Result<Vec<Value>, ClientError> {
        self.into_outputs(IdentifierSequence::as_items, |_, items| items.clone())
            .map(|chunks| chunks.into_iter().flatten().collect())
    }
}

/// Sorts the inputs of one failed chunk into the failure buckets.
///
/// Inputs the service named as unresolved go to `not_found`. When it named
/// any, the rest of the chunk was rejected along with them and is reported
/// as failed with a [`ClientError::ChunkRejected`] cause.
fn record_failed_chunk(failure: &mut BatchFailure, inputs: Vec<Value>, error: ClientError) {
    let missing: Vec<Identifier> = error
        .api_error()
        .filter(|api| api.is_not_found())
        .map(|api| api.missing.iter().filter_map(Identifier::from_json).collect())
        .unwrap_or_default();
    let (unresolved, rest): (Vec<Value>, Vec<Value>) = inputs.into_iter().partition(|item| {
        Identifier::from_json(item).is_some_and(|id| missing.contains(&id))
    });

    let unknown = error.outcome_is_unknown();
    let cause = if unresolved.is_empty() {
        Arc::new(error)
    } else {
        Arc::new(ClientError::ChunkRejected(Arc::new(error)))
    };
    failure.not_found.extend(unresolved);

    let entries = rest.into_iter().map(|item| FailedItem {
        item,
        cause: Arc::clone(&cause),
    });
    if unknown {
        failure.unknown.extend(entries);
    } else {
        failure.failed.extend(entries);
    }
}

/// Runs `operation` once per input with at most `max_workers` in flight.
///
/// Outcomes come back in input order whatever order the chunks complete in.
/// In [`FailureMode::FailFast`] the first failure to complete drops every
/// in-flight chunk (releasing its admission ticket). Those are reported as
/// cancelled and the inputs not yet dispatched as skipped. In
/// [`FailureMode::CollectAll`] the batch runs on its own task, so it
/// completes even if the caller stops waiting.
#[instrument(skip(inputs, operation), fields(chunks = inputs.len()))]
pub async fn execute_tasks<I, T, F, Fut>(
    inputs: Vec<I>,
    max_workers: usize,
    mode: FailureMode,
    operation: F,
) -> Result<TasksSummary<I, T>, ClientError>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
{
    match mode {
        FailureMode::FailFast => Ok(run_fail_fast(inputs, max_workers, operation).await),
        FailureMode::CollectAll => tokio::spawn(run_collect_all(inputs, max_workers, operation))
            .await
            .map_err(|err| ClientError::TaskAborted(err.to_string())),
    }
}

async fn run_collect_all<I, T, F, Fut>(
    inputs: Vec<I>,
    max_workers: usize,
    operation: F,
) -> TasksSummary<I, T>
where
    I: Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let outcomes = stream::iter(inputs)
        .map(|input| {
            let pending = operation(input.clone());
            async move {
                match pending.await {
                    Ok(output) => TaskOutcome::Succeeded { input, output },
                    Err(error) => TaskOutcome::Failed { input, error },
                }
            }
        })
        .buffered(max_workers.max(1))
        .collect()
        .await;
    TasksSummary { outcomes }
}

async fn run_fail_fast<I, T, F, Fut>(
    inputs: Vec<I>,
    max_workers: usize,
    operation: F,
) -> TasksSummary<I, T>
where
    I: Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let total = inputs.len();
    let mut settled: Vec<Option<Result<T, ClientError>>> = (0..total).map(|_| None).collect();
    let mut dispatched = 0;

    {
        // A chunk's future is only created when the stream pulls it, so
        // dropping the stream leaves undispatched chunks unsent.
        let mut results = stream::iter(inputs.iter().cloned().enumerate())
            .map(|(index, input)| {
                dispatched += 1;
                let pending = operation(input);
                async move { (index, pending.await) }
            })
            .buffer_unordered(max_workers.max(1));

        while let Some((index, result)) = results.next().await {
            let failed = result.is_err();
            settled[index] = Some(result);
            if failed {
                debug!(index, "chunk failed, aborting remaining chunks");
                break;
            }
        }
    }

    let outcomes = inputs
        .into_iter()
        .zip(settled)
        .enumerate()
        .map(|(index, (input, result))| match result {
            Some(Ok(output)) => TaskOutcome::Succeeded { input, output },
            Some(Err(error)) => TaskOutcome::Failed { input, error },
            None if index < dispatched => TaskOutcome::Cancelled { input },
            None => TaskOutcome::Skipped { input },
        })
        .collect();
    TasksSummary { outcomes }
}
