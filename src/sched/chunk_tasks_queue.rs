//! Chunk-ordered task store: chunks are visited in ascending id order with
//! wrap-around, and the cursor never leaves a chunk that still has work
//! running.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use ssw_api_types::{ChunkId, QueryId};
use ssw_memman::MemMan;

use crate::sched::chunk_tasks::{ChunkTasks, ReadyState};
use crate::task::Task;

/// No internal mutex; the owning scheduler serializes all access.
pub struct ChunkTasksQueue {
    mem_man: Arc<dyn MemMan>,
    chunk_map: BTreeMap<ChunkId, ChunkTasks>,
    active_chunk: Option<ChunkId>,
    ready_chunk: Option<ChunkId>,
    resource_starved: bool,
}

impl ChunkTasksQueue {
    pub fn new(mem_man: Arc<dyn MemMan>) -> Self {
        Self {
            mem_man,
            chunk_map: BTreeMap::new(),
            active_chunk: None,
            ready_chunk: None,
            resource_starved: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_map.is_empty()
    }

    pub fn size(&self) -> usize {
        self.chunk_map.values().map(|ct| ct.size()).sum()
    }

    pub fn active_chunk_id(&self) -> Option<ChunkId> {
        self.active_chunk
    }

    pub fn is_resource_starved(&self) -> bool {
        self.resource_starved
    }

    pub fn queue_task(&mut self, task: Arc<Task>) {
        let chunk_id = task.chunk_id();
        self.chunk_map
            .entry(chunk_id)
            .or_insert_with(|| ChunkTasks::new(chunk_id, self.mem_man.clone()))
            .queue_task(task);
    }

    /// True when the next dispatch will come from a different chunk than the
    /// current one; used to gate the scheduler's active-chunk limit.
    pub fn next_task_different_chunk_id(&self) -> bool {
        match self.active_chunk {
            None => true,
            Some(chunk) => self
                .chunk_map
                .get(&chunk)
                .map(|ct| ct.ready_to_advance())
                .unwrap_or(true),
        }
    }

    /// Probe for a runnable task, caching the chunk that has one.
    ///
    /// The scan stops at a chunk that reports NO_RESOURCES: advancing past a
    /// starved chunk could starve it forever.
    pub fn ready(&mut self, use_flexible_lock: bool) -> bool {
        if self.ready_chunk.is_some() {
            return true;
        }
        if self.chunk_map.is_empty() {
            return false;
        }

        // Establish the cursor on first use.
        if self.active_chunk.is_none() {
            let first = *self.chunk_map.keys().next().unwrap();
            self.active_chunk = Some(first);
            self.chunk_map.get_mut(&first).unwrap().set_active(true);
        }
        let mut active = self.active_chunk.unwrap();

        if self.chunk_map.get_mut(&active).unwrap().ready(use_flexible_lock) == ReadyState::Ready {
            self.ready_chunk = Some(active);
            return true;
        }

        // Move the cursor when the current chunk is drained; pending tasks
        // merge back for the next cycle as the chunk goes inactive.
        if self.chunk_map.get_mut(&active).unwrap().ready_to_advance() {
            let next = self.next_chunk_after(active);
            let chunk_tasks = self.chunk_map.get_mut(&active).unwrap();
            chunk_tasks.set_active(false);
            if chunk_tasks.is_empty() {
                self.chunk_map.remove(&active);
                if next == active || self.chunk_map.is_empty() {
                    self.active_chunk = None;
                    return false;
                }
            }
            self.active_chunk = Some(next);
            self.chunk_map.get_mut(&next).unwrap().set_active(true);
            active = next;
        }

        // Probe forward from the cursor, wrapping once around.
        for chunk in self.probe_order(active) {
            match self
                .chunk_map
                .get_mut(&chunk)
                .unwrap()
                .ready(use_flexible_lock)
            {
                ReadyState::Ready => {
                    self.resource_starved = false;
                    self.ready_chunk = Some(chunk);
                    return true;
                }
                ReadyState::NoResources => {
                    self.resource_starved = true;
                    return false;
                }
                ReadyState::NotReady => continue,
            }
        }
        false
    }

    pub fn get_task(&mut self, use_flexible_lock: bool) -> Option<Arc<Task>> {
        if self.ready_chunk.is_none() {
            self.ready(use_flexible_lock);
        }
        let chunk = self.ready_chunk.take()?;
        self.chunk_map.get_mut(&chunk)?.get_task(use_flexible_lock)
    }

    pub fn task_complete(&mut self, task: &Arc<Task>) {
        if let Some(chunk_tasks) = self.chunk_map.get_mut(&task.chunk_id()) {
            chunk_tasks.task_complete(task);
        }
    }

    pub fn remove_queued_of_query(&mut self, query_id: QueryId, max: usize) -> Vec<Arc<Task>> {
        let mut removed = Vec::new();
        for chunk_tasks in self.chunk_map.values_mut() {
            if removed.len() >= max {
                break;
            }
            chunk_tasks.remove_queued_of_query(query_id, max, &mut removed);
        }
        // Fully drained chunks stay in the map until the cursor passes them,
        // same as after normal dispatch.
        removed
    }

    /// Successor of `chunk` in ascending order, wrapping to the front.
    fn next_chunk_after(&self, chunk: ChunkId) -> ChunkId {
        self.chunk_map
            .range((Bound::Excluded(chunk), Bound::Unbounded))
            .next()
            .map(|(id, _)| *id)
            .unwrap_or_else(|| *self.chunk_map.keys().next().unwrap())
    }

    /// All chunk ids starting at `from` in visiting order, one full lap.
    fn probe_order(&self, from: ChunkId) -> Vec<ChunkId> {
        let mut order: Vec<ChunkId> = self
            .chunk_map
            .range((Bound::Included(from), Bound::Unbounded))
            .map(|(id, _)| *id)
            .collect();
        order.extend(
            self.chunk_map
                .range((Bound::Unbounded, Bound::Excluded(from)))
                .map(|(id, _)| *id),
        );
        order
    }
}
