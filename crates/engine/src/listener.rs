//! Step listeners.
//!
//! Listeners are passed explicitly when a step is built. Per chunk they are
//! called in this order: before/after each read, before/after each process,
//! before/after the write, after the chunk, then once per final skip decision.
//! An error from any callback fails the step; it is never absorbed.

use std::sync::Arc;

use batchforge_core::{ExitStatus, StepExecution};

use crate::error::StepError;

#[allow(unused_variables)]
pub trait StepListener<I, O>: Send + Sync {
    fn before_step(&self, step: &StepExecution) -> anyhow::Result<()> {
        Ok(())
    }

    /// May return an exit status to combine with the step's own.
    fn after_step(&self, step: &StepExecution) -> anyhow::Result<Option<ExitStatus>> {
        Ok(None)
    }

    fn before_chunk(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_chunk(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_chunk_error(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn before_read(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_read(&self, item: &I) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_read_error(&self, error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }

    fn before_process(&self, item: &I) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_process(&self, item: &I, result: Option<&O>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_process_error(&self, item: &I, error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }

    fn before_write(&self, items: &[O]) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_write(&self, items: &[O]) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_write_error(&self, items: &[O], error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_skip_in_read(&self, error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_skip_in_process(&self, item: &I, error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_skip_in_write(&self, item: &O, error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fans each callback out to every registered listener.
///
/// `before_*` callbacks run in registration order, `after_*` callbacks in
/// reverse order.
pub struct CompositeListener<I, O> {
    listeners: Vec<Arc<dyn StepListener<I, O>>>,
}

impl<I, O> Default for CompositeListener<I, O> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<I, O> Clone for CompositeListener<I, O> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<I, O> std::fmt::Debug for CompositeListener<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeListener")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn wrap(callback: &'static str) -> impl FnOnce(anyhow::Error) -> StepError {
    move |source| StepError::Listener { callback, source }
}

impl<I, O> CompositeListener<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn StepListener<I, O>>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn forward(
        &self,
        callback: &'static str,
        mut f: impl FnMut(&dyn StepListener<I, O>) -> anyhow::Result<()>,
    ) -> Result<(), StepError> {
        for listener in &self.listeners {
            f(listener.as_ref()).map_err(wrap(callback))?;
        }
        Ok(())
    }

    fn reverse(
        &self,
        callback: &'static str,
        mut f: impl FnMut(&dyn StepListener<I, O>) -> anyhow::Result<()>,
    ) -> Result<(), StepError> {
        for listener in self.listeners.iter().rev() {
            f(listener.as_ref()).map_err(wrap(callback))?;
        }
        Ok(())
    }

    pub fn before_step(&self, step: &StepExecution) -> Result<(), StepError> {
        self.forward("before_step", |l| l.before_step(step))
    }

    /// Combined exit status contributed by the listeners, if any.
    pub fn after_step(&self, step: &StepExecution) -> Result<Option<ExitStatus>, StepError> {
        let mut combined: Option<ExitStatus> = None;
        for listener in self.listeners.iter().rev() {
            if let Some(status) = listener.after_step(step).map_err(wrap("after_step"))? {
                combined = Some(match combined {
                    Some(previous) => previous.and(status),
                    None => status,
                });
            }
        }
        Ok(combined)
    }

    pub fn before_chunk(&self) -> Result<(), StepError> {
        self.forward("before_chunk", |l| l.before_chunk())
    }

    pub fn after_chunk(&self) -> Result<(), StepError> {
        self.reverse("after_chunk", |l| l.after_chunk())
    }

    pub fn after_chunk_error(&self) -> Result<(), StepError> {
        self.reverse("after_chunk_error", |l| l.after_chunk_error())
    }

    pub fn before_read(&self) -> Result<(), StepError> {
        self.forward("before_read", |l| l.before_read())
    }

    pub fn after_read(&self, item: &I) -> Result<(), StepError> {
        self.reverse("after_read", |l| l.after_read(item))
    }

    pub fn on_read_error(&self, error: &anyhow::Error) -> Result<(), StepError> {
        self.reverse("on_read_error", |l| l.on_read_error(error))
    }

    pub fn before_process(&self, item: &I) -> Result<(), StepError> {
        self.forward("before_process", |l| l.before_process(item))
    }

    pub fn after_process(&self, item: &I, result: Option<&O>) -> Result<(), StepError> {
        self.reverse("after_process", |l| l.after_process(item, result))
    }

    pub fn on_process_error(&self, item: &I, error: &anyhow::Error) -> Result<(), StepError> {
        self.reverse("on_process_error", |l| l.on_process_error(item, error))
    }

    pub fn before_write(&self, items: &[O]) -> Result<(), StepError> {
        self.forward("before_write", |l| l.before_write(items))
    }

    pub fn after_write(&self, items: &[O]) -> Result<(), StepError> {
        self.reverse("after_write", |l| l.after_write(items))
    }

    pub fn on_write_error(&self, items: &[O], error: &anyhow::Error) -> Result<(), StepError> {
        self.reverse("on_write_error", |l| l.on_write_error(items, error))
    }

    pub fn on_skip_in_read(&self, error: &anyhow::Error) -> Result<(), StepError> {
        self.forward("on_skip_in_read", |l| l.on_skip_in_read(error))
    }

    pub fn on_skip_in_process(&self, item: &I, error: &anyhow::Error) -> Result<(), StepError> {
        self.forward("on_skip_in_process", |l| l.on_skip_in_process(item, error))
    }

    pub fn on_skip_in_write(&self, item: &O, error: &anyhow::Error) -> Result<(), StepError> {
        self.forward("on_skip_in_write", |l| l.on_skip_in_write(item, error))
    }
}
