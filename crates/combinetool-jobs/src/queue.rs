//! Job queue and batch partitioning.

use combinetool_core::Job;

/// Ordered, append-only list of pending jobs.
#[derive(Debug, Default, Clone)]
pub struct JobQueue {
    jobs: Vec<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Take every queued job, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs)
    }
}

impl Extend<Job> for JobQueue {
    fn extend<T: IntoIterator<Item = Job>>(&mut self, iter: T) {
        self.jobs.extend(iter);
    }
}

/// A contiguous slice of the queue that runs as one dispatch unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch<'a> {
    /// Zero-based position of the batch.
    pub index: usize,
    pub jobs: &'a [Job],
}

/// Split `jobs` into batches of `merge` jobs; the last batch may be shorter.
///
/// A `merge` of zero is treated as one.
pub fn partition(jobs: &[Job], merge: usize) -> Vec<Batch<'_>> {
    jobs.chunks(merge.max(1))
        .enumerate()
        .map(|(index, jobs)| Batch { index, jobs })
        .collect()
}
