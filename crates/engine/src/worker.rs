//! Concurrent chunk execution.
//!
//! Each worker thread runs whole chunks, reads included, in its own
//! transactions. Reads are serialized behind a mutex on the reader. The
//! calling thread is the coordinator: it receives every commit over a channel
//! and is the only writer of the step execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, mpsc};
use std::thread;

use batchforge_core::{StepContribution, StepExecution, describe_error};
use batchforge_infra::JobRepository;
use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::error::StepError;
use crate::item::{ItemReader, ItemWriter};
use crate::step::{Failure, Outcome, Pipeline, StopSignal, record_secondary_failure, update_writer};

enum Event {
    Committed(StepContribution),
    RolledBack,
    Failed {
        error: StepError,
        listener_error: Option<StepError>,
    },
}

struct Shared<'r, I> {
    reader: Mutex<&'r mut dyn ItemReader<I>>,
    exhausted: AtomicBool,
    abort: AtomicBool,
}

impl<'r, I> Shared<'r, I> {
    fn reader(&self) -> MutexGuard<'_, &'r mut dyn ItemReader<I>> {
        // A worker that panicked mid-read leaves nothing half-updated that
        // later reads depend on.
        match self.reader.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn should_stop(&self, stop: &StopSignal) -> bool {
        self.abort.load(Ordering::SeqCst) || self.exhausted.load(Ordering::SeqCst) || stop.is_stopped()
    }
}

pub(crate) fn run_concurrent<I, O>(
    pipeline: &Pipeline<I, O>,
    throttle_limit: usize,
    reader: &mut dyn ItemReader<I>,
    writer: &dyn ItemWriter<O>,
    step: &mut StepExecution,
    repository: &dyn JobRepository,
    stop: &StopSignal,
) -> Result<(), StepError>
where
    I: Send,
    O: Clone + Send,
{
    let shared = Shared {
        reader: Mutex::new(reader),
        exhausted: AtomicBool::new(false),
        abort: AtomicBool::new(false),
    };
    let (events, received) = mpsc::channel::<Event>();
    let mut first_error: Option<StepError> = None;

    thread::scope(|scope| {
        for worker in 0..throttle_limit {
            let events = events.clone();
            let shared = &shared;
            let spawned = thread::Builder::new()
                .name(format!("chunk-worker-{worker}"))
                .spawn_scoped(scope, move || work(pipeline, shared, stop, &events));
            if let Err(err) = spawned {
                shared.abort.store(true, Ordering::SeqCst);
                first_error.get_or_insert(StepError::Unrecoverable(
                    anyhow::Error::new(err).context("spawning chunk worker"),
                ));
            }
        }
        drop(events);

        for event in received {
            match event {
                Event::Committed(contribution) => {
                    step.apply(&contribution);
                    step.counters.commit_count += 1;
                    let saved = update_writer(writer, step)
                        .and_then(|()| repository.checkpoint_step_execution(step).map_err(StepError::from));
                    if let Err(err) = saved {
                        shared.abort.store(true, Ordering::SeqCst);
                        first_error.get_or_insert(err);
                    } else if step.terminate_only {
                        shared.abort.store(true, Ordering::SeqCst);
                    }
                }
                Event::RolledBack => step.counters.rollback_count += 1,
                Event::Failed { error, listener_error } => {
                    shared.abort.store(true, Ordering::SeqCst);
                    if let Some(listener_error) = listener_error {
                        record_secondary_failure(step, "after_chunk_error listener failed", &listener_error);
                    }
                    first_error.get_or_insert(error);
                }
            }
        }
    });

    if let Some(err) = first_error {
        return Err(err);
    }
    if !shared.exhausted.load(Ordering::SeqCst) {
        return Err(StepError::Interrupted);
    }
    Ok(())
}

fn work<I, O: Clone>(pipeline: &Pipeline<I, O>, shared: &Shared<'_, I>, stop: &StopSignal, events: &mpsc::Sender<Event>) {
    let mut pending: Option<Chunk<I, O>> = None;

    loop {
        if pending.is_none() && shared.should_stop(stop) {
            break;
        }

        let outcome = pipeline.attempt(pending.take(), |p| {
            let mut reader = shared.reader();
            let chunk = p.provider.provide(&mut **reader, &p.listener, &p.tally)?;
            if chunk.is_end_of_input() {
                shared.exhausted.store(true, Ordering::SeqCst);
            }
            Ok(chunk)
        });

        let event = match outcome {
            Ok(Outcome::Committed { contribution, chunk }) => {
                if !chunk.is_finished() {
                    pending = Some(chunk);
                }
                Event::Committed(contribution)
            }
            Ok(Outcome::EndOfInput) => break,
            Ok(Outcome::RolledBack { replay }) => {
                pending = replay;
                Event::RolledBack
            }
            Err(Failure {
                error,
                rolled_back,
                listener_error,
            }) => {
                if rolled_back {
                    let _ = events.send(Event::RolledBack);
                }
                warn!(error = %describe_error(&error), "chunk worker failed");
                let _ = events.send(Event::Failed { error, listener_error });
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("chunk worker finished");
}
