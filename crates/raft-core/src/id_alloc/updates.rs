//! # id generator updates
//!
//! why: marking ids used/free is hot; batches for one generator are coalesced
//! relations: built on work_sync.rs, targets an id generator of the storage engine
//! what: IdMark, IdGeneratorUpdates, IdMarkTarget, IdGeneratorWorkSyncs

use super::IdType;
use crate::error::{RaftError, Result};
use crate::work_sync::{AsyncApply, Work, WorkSync};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMark {
    Used(u64),
    Free(u64),
}

/// An id generator in the storage engine; `mark` must be durable on return
pub trait IdMarkTarget: Send {
    fn mark(&mut self, marks: &[IdMark]) -> Result<()>;
}

/// One caller's batch of marks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdGeneratorUpdates {
    marks: Vec<IdMark>,
}

impl IdGeneratorUpdates {
    pub fn new(marks: Vec<IdMark>) -> Self {
        Self { marks }
    }

    pub fn used(ids: impl IntoIterator<Item = u64>) -> Self {
        Self::new(ids.into_iter().map(IdMark::Used).collect())
    }

    pub fn freed(ids: impl IntoIterator<Item = u64>) -> Self {
        Self::new(ids.into_iter().map(IdMark::Free).collect())
    }

    pub fn marks(&self) -> &[IdMark] {
        &self.marks
    }
}

impl Work<Box<dyn IdMarkTarget>> for IdGeneratorUpdates {
    fn combine(mut self, other: Self) -> Self {
        self.marks.extend(other.marks);
        self
    }

    fn apply(self, target: &mut Box<dyn IdMarkTarget>) -> Result<()> {
        target.mark(&self.marks)
    }
}

/// One combiner per id generator, built at startup
pub struct IdGeneratorWorkSyncs {
    syncs: HashMap<IdType, WorkSync<Box<dyn IdMarkTarget>, IdGeneratorUpdates>>,
}

impl IdGeneratorWorkSyncs {
    pub fn new(targets: impl IntoIterator<Item = (IdType, Box<dyn IdMarkTarget>)>) -> Self {
        Self {
            syncs: targets
                .into_iter()
                .map(|(id_type, target)| (id_type, WorkSync::new(target)))
                .collect(),
        }
    }

    /// submit marks for `id_type`; wait on the handle for durability
    pub fn apply_async(
        &self,
        id_type: IdType,
        updates: IdGeneratorUpdates,
    ) -> Result<AsyncApply<'_, Box<dyn IdMarkTarget>, IdGeneratorUpdates>> {
        let sync = self
            .syncs
            .get(&id_type)
            .ok_or_else(|| RaftError::Config(format!("no id generator registered for {}", id_type)))?;
        Ok(sync.apply_async(updates))
    }

    pub fn apply(&self, id_type: IdType, updates: IdGeneratorUpdates) -> Result<()> {
        self.apply_async(id_type, updates)?.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;

    #[derive(Clone, Default)]
    struct Recording {
        flushes: Arc<Mutex<Vec<Vec<IdMark>>>>,
    }

    impl IdMarkTarget for Recording {
        fn mark(&mut self, marks: &[IdMark]) -> Result<()> {
            self.flushes.lock().push(marks.to_vec());
            Ok(())
        }
    }

    #[test]
    fn batches_for_one_generator_are_flushed_together() {
        let target = Recording::default();
        let syncs = IdGeneratorWorkSyncs::new(vec![(
            IdType::Node,
            Box::new(target.clone()) as Box<dyn IdMarkTarget>,
        )]);

        let a = syncs.apply_async(IdType::Node, IdGeneratorUpdates::used([1, 2])).unwrap();
        let b = syncs.apply_async(IdType::Node, IdGeneratorUpdates::freed([7])).unwrap();
        a.wait().unwrap();
        b.wait().unwrap();

        let flushes = target.flushes.lock();
        assert_eq!(flushes.len(), 1);
        assert_eq!(
            flushes[0],
            vec![IdMark::Used(1), IdMark::Used(2), IdMark::Free(7)]
        );
    }

    #[test]
    fn every_mark_lands_under_contention() {
        let target = Recording::default();
        let syncs = Arc::new(IdGeneratorWorkSyncs::new(vec![(
            IdType::Relationship,
            Box::new(target.clone()) as Box<dyn IdMarkTarget>,
        )]));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let syncs = Arc::clone(&syncs);
                thread::spawn(move || {
                    for i in 0..25u64 {
                        syncs
                            .apply(IdType::Relationship, IdGeneratorUpdates::used([t * 1000 + i]))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let marked: usize = target.flushes.lock().iter().map(Vec::len).sum();
        assert_eq!(marked, 100);
    }

    #[test]
    fn unregistered_type_is_a_config_error() {
        let syncs = IdGeneratorWorkSyncs::new(Vec::new());
        assert!(matches!(
            syncs.apply(IdType::Schema, IdGeneratorUpdates::used([1])),
            Err(RaftError::Config(_))
        ));
    }
}
