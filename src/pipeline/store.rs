//! Task storage behind a trait so a durable store can replace the in-memory one.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::task::Task;
use crate::error::CoreError;

pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails if the id is taken.
    fn insert(&self, task: Task) -> Result<(), CoreError>;

    fn get(&self, id: &str) -> Option<Task>;

    /// Apply `apply` to a copy of the task and commit it only if it returns `Ok`.
    /// The check and the write happen under one lock, so `apply` can act as a
    /// compare-and-set.
    fn update(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut Task) -> Result<(), CoreError>,
    ) -> Result<Task, CoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, task: Task) -> Result<(), CoreError> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(&task.id) {
            return Err(CoreError::InvalidSource(format!("Task {} already exists", task.id)));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn get(&self, id: &str) -> Option<Task> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn update(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut Task) -> Result<(), CoreError>,
    ) -> Result<Task, CoreError> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let stored = tasks
            .get_mut(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))?;

        let mut draft = stored.clone();
        apply(&mut draft)?;
        draft.updated_at = chrono::Utc::now();
        *stored = draft.clone();
        Ok(draft)
    }

    fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
