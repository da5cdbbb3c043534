use crate::error::RunnerError;

use parking_lot::Mutex;

/// The outcome recorded for one task.
pub type TaskResult<O> = Result<O, RunnerError>;

/// Per-task result storage, indexed by submission order.
///
/// Slots are reserved at enqueue time, filled at most once by the worker that
/// ran the task, and sealed when the run ends. Sealing turns every empty slot
/// into `Cancelled`; fills arriving after that are rejected.
#[derive(Debug)]
pub(crate) struct ResultSlots<O> {
  inner: Mutex<SlotsInner<O>>,
}

#[derive(Debug)]
struct SlotsInner<O> {
  slots: Vec<Option<TaskResult<O>>>,
  filled: usize,
  sealed: bool,
}

impl<O> ResultSlots<O> {
  pub(crate) fn new() -> Self {
    Self {
      inner: Mutex::new(SlotsInner {
        slots: Vec::new(),
        filled: 0,
        sealed: false,
      }),
    }
  }

  /// Reserves the next slot and returns its index.
  pub(crate) fn reserve(&self) -> Result<usize, RunnerError> {
    let mut inner = self.inner.lock();
    if inner.sealed {
      return Err(RunnerError::QueueClosed);
    }
    inner.slots.push(None);
    Ok(inner.slots.len() - 1)
  }

  /// Gives back a slot whose task never made it into the queue. Only the most
  /// recent reservation can be released.
  pub(crate) fn release(&self, index: usize) {
    let mut inner = self.inner.lock();
    if !inner.sealed && index + 1 == inner.slots.len() && inner.slots[index].is_none() {
      inner.slots.pop();
    }
  }

  /// Records the outcome of task `index`. Returns `false` if the slots were
  /// already sealed or the slot was already filled.
  pub(crate) fn fill(&self, index: usize, result: TaskResult<O>) -> bool {
    let mut inner = self.inner.lock();
    if inner.sealed {
      return false;
    }
    let Some(slot) = inner.slots.get_mut(index) else {
      return false;
    };
    if slot.is_some() {
      return false;
    }
    *slot = Some(result);
    inner.filled += 1;
    true
  }

  pub(crate) fn len(&self) -> usize {
    self.inner.lock().slots.len()
  }

  pub(crate) fn filled(&self) -> usize {
    self.inner.lock().filled
  }

  /// Seals the slots and returns their contents in submission order, along
  /// with the indices that were still empty and are now `Cancelled`.
  ///
  /// Returns `None` if already sealed.
  pub(crate) fn seal(&self) -> Option<(Vec<TaskResult<O>>, Vec<usize>)> {
    let mut inner = self.inner.lock();
    if inner.sealed {
      return None;
    }
    inner.sealed = true;
    let mut unfinished = Vec::new();
    let results = std::mem::take(&mut inner.slots)
      .into_iter()
      .enumerate()
      .map(|(index, slot)| {
        slot.unwrap_or_else(|| {
          unfinished.push(index);
          Err(RunnerError::Cancelled)
        })
      })
      .collect();
    Some((results, unfinished))
  }
}
