//! Item collaborators: reader, processor, writer.
//!
//! Readers are driven from one thread at a time and take `&mut self`;
//! processors and writers may be shared by concurrent chunk workers.

use std::sync::Mutex;

use batchforge_core::ExecutionContext;

/// Source of items.
///
/// `open`/`update`/`close` are the stream hooks: `open` restores state from
/// the step's execution context, `update` writes the current position into it
/// at every chunk commit.
pub trait ItemReader<I>: Send {
    fn read(&mut self) -> anyhow::Result<Option<I>>;

    fn open(&mut self, _context: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn update(&mut self, _context: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// A transactional source redelivers items after a rollback, so the
    /// engine must not buffer them.
    fn is_transactional(&self) -> bool {
        false
    }
}

/// Transforms one item; `Ok(None)` filters it out.
pub trait ItemProcessor<I, O>: Send + Sync {
    fn process(&self, item: &I) -> anyhow::Result<Option<O>>;
}

impl<I, O, F> ItemProcessor<I, O> for F
where
    F: Fn(&I) -> anyhow::Result<Option<O>> + Send + Sync,
{
    fn process(&self, item: &I) -> anyhow::Result<Option<O>> {
        self(item)
    }
}

/// Sink for processed items, called once per chunk.
pub trait ItemWriter<O>: Send + Sync {
    fn write(&self, items: &[O]) -> anyhow::Result<()>;

    fn open(&self, _context: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn update(&self, _context: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<O, W> ItemWriter<O> for std::sync::Arc<W>
where
    W: ItemWriter<O> + ?Sized,
{
    fn write(&self, items: &[O]) -> anyhow::Result<()> {
        (**self).write(items)
    }

    fn open(&self, context: &ExecutionContext) -> anyhow::Result<()> {
        (**self).open(context)
    }

    fn update(&self, context: &mut ExecutionContext) -> anyhow::Result<()> {
        (**self).update(context)
    }

    fn close(&self) -> anyhow::Result<()> {
        (**self).close()
    }
}

/// Restartable reader over an in-memory list.
///
/// The number of items handed out is kept under `{name}.read.count`.
#[derive(Debug, Clone)]
pub struct ListItemReader<I> {
    name: String,
    items: Vec<I>,
    position: usize,
}

impl<I: Clone + Send> ListItemReader<I> {
    pub fn new(name: impl Into<String>, items: Vec<I>) -> Self {
        Self {
            name: name.into(),
            items,
            position: 0,
        }
    }

    fn count_key(&self) -> String {
        format!("{}.read.count", self.name)
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl<I: Clone + Send> ItemReader<I> for ListItemReader<I> {
    fn read(&mut self) -> anyhow::Result<Option<I>> {
        let item = self.items.get(self.position).cloned();
        if item.is_some() {
            self.position += 1;
        }
        Ok(item)
    }

    fn open(&mut self, context: &ExecutionContext) -> anyhow::Result<()> {
        self.position = match context.get_i64(&self.count_key()) {
            Some(count) => usize::try_from(count)
                .map_err(|_| anyhow::anyhow!("negative read count {count} in context"))?,
            None => 0,
        };
        Ok(())
    }

    fn update(&mut self, context: &mut ExecutionContext) -> anyhow::Result<()> {
        context.put_i64(self.count_key(), self.position as i64);
        Ok(())
    }
}

/// Collects everything written, in order.
#[derive(Debug)]
pub struct ListItemWriter<O> {
    written: Mutex<Vec<O>>,
}

impl<O: Clone> ListItemWriter<O> {
    pub fn new() -> Self {
        Self {
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn written(&self) -> Vec<O> {
        match self.written.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl<O: Clone + Send> ItemWriter<O> for ListItemWriter<O> {
    fn write(&self, items: &[O]) -> anyhow::Result<()> {
        self.written
            .lock()
            .map_err(|_| anyhow::anyhow!("list writer lock poisoned"))?
            .extend_from_slice(items);
        Ok(())
    }
}

/// Hands every item through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughProcessor;

impl<I: Clone> ItemProcessor<I, I> for PassThroughProcessor {
    fn process(&self, item: &I) -> anyhow::Result<Option<I>> {
        Ok(Some(item.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_reader_restores_its_position() {
        let mut reader = ListItemReader::new("numbers", vec![1, 2, 3]);
        reader.open(&ExecutionContext::new()).unwrap();
        assert_eq!(reader.read().unwrap(), Some(1));

        let mut context = ExecutionContext::new();
        reader.update(&mut context).unwrap();
        assert_eq!(context.get_i64("numbers.read.count"), Some(1));

        let mut restarted = ListItemReader::new("numbers", vec![1, 2, 3]);
        restarted.open(&context).unwrap();
        assert_eq!(restarted.read().unwrap(), Some(2));
        assert_eq!(restarted.read().unwrap(), Some(3));
        assert_eq!(restarted.read().unwrap(), None);
    }

    #[test]
    fn closures_are_processors() {
        let double = |n: &i32| -> anyhow::Result<Option<i32>> { Ok(Some(n * 2)) };
        assert_eq!(double.process(&4).unwrap(), Some(8));
        assert_eq!(PassThroughProcessor.process(&"a").unwrap(), Some("a"));
    }

    #[test]
    fn list_writer_appends() {
        let writer = ListItemWriter::new();
        writer.write(&[1, 2]).unwrap();
        writer.write(&[3]).unwrap();
        assert_eq!(writer.written(), vec![1, 2, 3]);
    }
}
