//! Two-list reconciliation of keyed, per-pass registrations.
//!
//! Children, background tasks and remembered values are all declared again
//! on every render pass. An [`ActiveStagingList`] matches each declaration
//! against what the previous pass left behind:
//!
//! ```text
//! pass N commits        active  = [a, b, c]   staging = []
//! pass N+1 declares c   active  = [a, b]      staging = [c]
//! pass N+1 declares d   active  = [a, b]      staging = [c, d]   (d is new)
//! pass N+1 commits      a, b removed          active  = [c, d]
//! ```
//!
//! Lookups are linear scans. Per-node registrations are few and usually
//! declared in the same order every pass, so the first active item tends to
//! match.

/// Active items from the last committed pass, and items staged this pass.
#[derive(Debug)]
pub struct ActiveStagingList<T> {
    active: Vec<T>,
    staging: Vec<T>,
}

impl<T> Default for ActiveStagingList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ActiveStagingList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            active: Vec::new(),
            staging: Vec::new(),
        }
    }

    /// Move the first active item matching `predicate` to staging, or stage
    /// the result of `create` if nothing matches.
    pub fn retain_or_create(
        &mut self,
        predicate: impl Fn(&T) -> bool,
        create: impl FnOnce() -> T,
    ) -> &mut T {
        let item = match self.active.iter().position(predicate) {
            Some(index) => self.active.remove(index),
            None => create(),
        };
        self.stage(item)
    }

    /// Move the first active item matching `predicate` to staging.
    pub fn retain(&mut self, predicate: impl Fn(&T) -> bool) -> Option<&mut T> {
        let index = self.active.iter().position(predicate)?;
        let item = self.active.remove(index);
        Some(self.stage(item))
    }

    /// Append a new item to staging.
    pub fn stage(&mut self, item: T) -> &mut T {
        let index = self.staging.len();
        self.staging.push(item);
        &mut self.staging[index]
    }

    /// Items staged so far this pass, in declaration order.
    pub fn staged(&self) -> &[T] {
        &self.staging
    }

    /// Items from the last committed pass that have not been retained yet.
    ///
    /// Between passes this is every live item.
    pub fn active(&self) -> &[T] {
        &self.active
    }

    /// Mutable view of [`ActiveStagingList::active`].
    pub fn active_mut(&mut self) -> &mut [T] {
        &mut self.active
    }

    /// Finish a pass: hand every unretained active item to `on_remove`, then
    /// make staging the new active list.
    pub fn commit_staging(&mut self, mut on_remove: impl FnMut(T)) {
        for item in self.active.drain(..) {
            on_remove(item);
        }
        std::mem::swap(&mut self.active, &mut self.staging);
    }

    /// Remove every item, active first.
    pub fn drain_all(&mut self) -> impl Iterator<Item = T> + '_ {
        self.active.drain(..).chain(self.staging.drain(..))
    }

    /// Total items held, active and staged.
    pub fn len(&self) -> usize {
        self.active.len() + self.staging.len()
    }

    /// Whether the list holds nothing.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.staging.is_empty()
    }
}
