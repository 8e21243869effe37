//! Slow-start batch execution.
//!
//! Fans an operation out over `count` items in waves whose size starts small
//! and doubles after every wave. A systemic failure (bad credentials, a broken
//! webhook) therefore costs a single call before it is noticed, while a
//! healthy run quickly reaches full fan-out.
//!
//! Each wave is a group of futures joined before the next wave starts; the
//! outcome of a wave is only inspected once every item in it has finished.

use std::future::Future;

use futures::future::join_all;

/// Initial wave size used for all per-employee finalizer mutations
pub const SLOW_START_INITIAL_BATCH_SIZE: usize = 1;

/// Result of a [`slow_start_batch`] run
#[derive(Debug)]
pub struct BatchOutcome<T, E> {
    /// Number of items whose call returned `Ok`
    pub successes: usize,
    /// The most recent error observed across all waves
    pub last_error: Option<E>,
    outputs: Vec<Option<T>>,
}

impl<T, E> BatchOutcome<T, E> {
    fn empty() -> Self {
        Self {
            successes: 0,
            last_error: None,
            outputs: Vec::new(),
        }
    }

    /// Value returned for item `index`, `None` if it failed or never ran
    pub fn output(&self, index: usize) -> Option<&T> {
        self.outputs.get(index).and_then(Option::as_ref)
    }

    /// Consume the outcome, returning the error if any item failed
    pub fn into_result(self) -> Result<usize, E> {
        match self.last_error {
            Some(e) => Err(e),
            None => Ok(self.successes),
        }
    }
}

/// Run `f` for every index in `[0, count)` in exponentially growing waves.
///
/// Wave sizes start at `initial_batch_size` (at least one) and double after
/// each wave, capped at the number of remaining items. All calls of a wave run
/// concurrently. When a wave has failures the last of them is kept; with
/// `short_circuit` the run stops there, otherwise it continues with the next
/// wave.
///
/// `f` receives the item index and the most recent error seen in an earlier
/// wave, if any.
pub async fn slow_start_batch<T, E, F, Fut>(
    count: usize,
    initial_batch_size: usize,
    short_circuit: bool,
    mut f: F,
) -> BatchOutcome<T, E>
where
    F: FnMut(usize, Option<&E>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if count == 0 {
        return BatchOutcome::empty();
    }

    let mut outcome = BatchOutcome {
        successes: 0,
        last_error: None,
        outputs: Vec::with_capacity(count),
    };
    let mut remaining = count;
    let mut batch_size = initial_batch_size.max(1).min(remaining);
    let mut next = 0;

    while batch_size > 0 {
        let wave: Vec<Fut> = (next..next + batch_size)
            .map(|index| f(index, outcome.last_error.as_ref()))
            .collect();

        let mut wave_error = None;
        for result in join_all(wave).await {
            match result {
                Ok(value) => {
                    outcome.successes += 1;
                    outcome.outputs.push(Some(value));
                }
                Err(e) => {
                    outcome.outputs.push(None);
                    wave_error = Some(e);
                }
            }
        }

        next += batch_size;
        remaining -= batch_size;

        if let Some(e) = wave_error {
            outcome.last_error = Some(e);
            if short_circuit {
                return outcome;
            }
        }

        batch_size = (batch_size * 2).min(remaining);
    }

    outcome
}
