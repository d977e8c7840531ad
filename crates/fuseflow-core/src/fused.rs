//! Several typed scatterers behind one interface.
//!
//! A [`FusedScatterer<P>`] holds one [`Scatterer<T>`] per element type of
//! the payload union `P`. The registry is built once when the stage is
//! constructed; afterwards type tags and outbound slots resolve to a
//! sub-scatterer through two hash lookups.
//!
//! Each type keeps its own credit accounting. What the types share is the
//! slot namespace (owned by the stage) and the aggregate signals:
//! [`capacity`](FusedScatterer::capacity) is the minimum over the types
//! still accepting data, so one congested type congests the whole stage,
//! and [`clean`](FusedScatterer::clean) is the AND over all types.

use std::any::Any;
use std::time::Duration;

use fxhash::FxHashMap;

use crate::config::{DispatchPolicy, DEFAULT_MAX_BATCH_SIZE};
use crate::error::StreamError;
use crate::message::FusedLayout;
use crate::path::{Path, SlotId};
use crate::payload::{Element, Payload, TypeTag};
use crate::scatterer::{DispatchOutcome, Scatterer};

/// Type-erased view of a [`Scatterer<T>`] whose `T` is a variant of `P`.
pub(crate) trait ErasedScatterer<P>: Send {
    fn type_tag(&self) -> TypeTag;
    /// Appends the payload's elements, or hands the payload back if it holds
    /// another type.
    fn absorb(&mut self, payload: P) -> Result<usize, P>;
    fn capacity(&self) -> usize;
    fn buffered(&self) -> usize;
    fn num_paths(&self) -> usize;
    fn num_live_paths(&self) -> usize;
    fn clean(&self) -> bool;
    fn finished(&self) -> bool;
    fn assign(&mut self, path: Path);
    fn path(&self, slot: SlotId) -> Option<&Path>;
    fn path_mut(&mut self, slot: SlotId) -> Option<&mut Path>;
    fn paths<'a>(&'a self) -> Box<dyn Iterator<Item = &'a Path> + 'a>;
    fn take_pending(&mut self, slot: SlotId) -> Option<usize>;
    fn abort_path(&mut self, slot: SlotId) -> Option<usize>;
    fn close_all(&mut self);
    fn dispatch(&mut self, now: Duration) -> DispatchOutcome<P>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<P, T> ErasedScatterer<P> for Scatterer<T>
where
    P: Payload,
    T: Element<P>,
{
    fn type_tag(&self) -> TypeTag {
        T::TAG
    }

    fn absorb(&mut self, payload: P) -> Result<usize, P> {
        let items = T::unwrap(payload)?;
        let n = items.len();
        self.extend(items);
        Ok(n)
    }

    fn capacity(&self) -> usize {
        Scatterer::capacity(self)
    }

    fn buffered(&self) -> usize {
        Scatterer::buffered(self)
    }

    fn num_paths(&self) -> usize {
        Scatterer::num_paths(self)
    }

    fn num_live_paths(&self) -> usize {
        Scatterer::num_live_paths(self)
    }

    fn clean(&self) -> bool {
        Scatterer::clean(self)
    }

    fn finished(&self) -> bool {
        Scatterer::finished(self)
    }

    fn assign(&mut self, path: Path) {
        Scatterer::assign(self, path);
    }

    fn path(&self, slot: SlotId) -> Option<&Path> {
        Scatterer::path(self, slot)
    }

    fn path_mut(&mut self, slot: SlotId) -> Option<&mut Path> {
        Scatterer::path_mut(self, slot)
    }

    fn paths<'a>(&'a self) -> Box<dyn Iterator<Item = &'a Path> + 'a> {
        Box::new(Scatterer::paths(self))
    }

    fn take_pending(&mut self, slot: SlotId) -> Option<usize> {
        Scatterer::take_pending(self, slot)
    }

    fn abort_path(&mut self, slot: SlotId) -> Option<usize> {
        Scatterer::abort_path(self, slot)
    }

    fn close_all(&mut self) {
        Scatterer::close_all(self);
    }

    fn dispatch(&mut self, now: Duration) -> DispatchOutcome<P> {
        Scatterer::dispatch(self, now).map(T::wrap)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Outbound side of a stage: one scatterer per element type.
pub struct FusedScatterer<P> {
    scatterers: Vec<Box<dyn ErasedScatterer<P>>>,
    by_tag: FxHashMap<TypeTag, usize>,
    by_slot: FxHashMap<SlotId, usize>,
    policy: DispatchPolicy,
    max_batch_size: usize,
}

impl<P: Payload> Default for FusedScatterer<P> {
    fn default() -> Self {
        Self::new(DispatchPolicy::default(), DEFAULT_MAX_BATCH_SIZE)
    }
}

impl<P: Payload> std::fmt::Debug for FusedScatterer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusedScatterer")
            .field("layout", &self.layout())
            .field("num_paths", &self.num_paths())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<P: Payload> FusedScatterer<P> {
    /// Creates an empty fused scatterer. Every registered type uses `policy`
    /// and `max_batch_size`.
    #[must_use]
    pub fn new(policy: DispatchPolicy, max_batch_size: usize) -> Self {
        Self {
            scatterers: Vec::new(),
            by_tag: FxHashMap::default(),
            by_slot: FxHashMap::default(),
            policy,
            max_batch_size,
        }
    }

    /// Registers a scatterer for `T`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::DuplicateType`] if `T` is already registered.
    pub fn register<T: Element<P>>(&mut self) -> Result<(), StreamError> {
        if self.by_tag.contains_key(&T::TAG) {
            return Err(StreamError::DuplicateType(T::TAG));
        }
        self.by_tag.insert(T::TAG, self.scatterers.len());
        self.scatterers
            .push(Box::new(Scatterer::<T>::new(self.policy, self.max_batch_size)));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::DuplicateType`] if `T` is already registered.
    pub fn with<T: Element<P>>(mut self) -> Result<Self, StreamError> {
        self.register::<T>()?;
        Ok(self)
    }

    /// The scatterer for `T`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnregisteredType`] if `T` was never registered.
    pub fn get<T: Element<P>>(&self) -> Result<&Scatterer<T>, StreamError> {
        self.by_tag
            .get(&T::TAG)
            .and_then(|&i| self.scatterers[i].as_any().downcast_ref())
            .ok_or(StreamError::UnregisteredType(T::TAG))
    }

    /// The scatterer for `T`, mutably.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnregisteredType`] if `T` was never registered.
    pub fn get_mut<T: Element<P>>(&mut self) -> Result<&mut Scatterer<T>, StreamError> {
        match self.by_tag.get(&T::TAG) {
            Some(&i) => self.scatterers[i]
                .as_any_mut()
                .downcast_mut()
                .ok_or(StreamError::UnregisteredType(T::TAG)),
            None => Err(StreamError::UnregisteredType(T::TAG)),
        }
    }

    /// Wires an outbound path into the scatterer for `T`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnregisteredType`] if `T` was never registered.
    pub fn assign<T: Element<P>>(&mut self, path: Path) -> Result<(), StreamError> {
        self.assign_tagged(T::TAG, path)
    }

    /// Wires an outbound path into the scatterer registered under `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnregisteredType`] if nothing is registered
    /// under `tag`.
    pub fn assign_tagged(&mut self, tag: TypeTag, path: Path) -> Result<(), StreamError> {
        let i = *self
            .by_tag
            .get(&tag)
            .ok_or(StreamError::UnregisteredType(tag))?;
        self.by_slot.insert(path.slot(), i);
        self.scatterers[i].assign(path);
        Ok(())
    }

    /// Returns `true` if a scatterer is registered under `tag`.
    #[must_use]
    pub fn contains(&self, tag: TypeTag) -> bool {
        self.by_tag.contains_key(&tag)
    }

    /// Returns `true` if no type is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scatterers.is_empty()
    }

    /// Registered type tags in registration order.
    #[must_use]
    pub fn layout(&self) -> FusedLayout {
        self.scatterers.iter().map(|s| s.type_tag()).collect()
    }

    /// Routes a payload into the buffer of its type.
    ///
    /// Returns the number of absorbed elements.
    ///
    /// # Errors
    ///
    /// Hands the payload back untouched if its type is not registered.
    pub fn absorb(&mut self, payload: P) -> Result<usize, P> {
        match self.by_tag.get(&payload.type_tag()) {
            Some(&i) => self.scatterers[i].absorb(payload),
            None => Err(payload),
        }
    }

    /// Minimum capacity over the types that still accept data.
    ///
    /// `usize::MAX` if no such type exists.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.scatterers
            .iter()
            .filter(|s| !s.finished())
            .map(|s| s.capacity())
            .min()
            .unwrap_or(usize::MAX)
    }

    /// Capacity of the scatterer registered under `tag`.
    #[must_use]
    pub fn capacity_of(&self, tag: TypeTag) -> Option<usize> {
        self.by_tag.get(&tag).map(|&i| self.scatterers[i].capacity())
    }

    /// Number of outbound paths over all types, closed ones included.
    #[must_use]
    pub fn num_paths(&self) -> usize {
        self.scatterers.iter().map(|s| s.num_paths()).sum()
    }

    /// Number of outbound paths that are not closed, over all types.
    #[must_use]
    pub fn num_live_paths(&self) -> usize {
        self.scatterers.iter().map(|s| s.num_live_paths()).sum()
    }

    /// Returns `true` if every type is clean.
    #[must_use]
    pub fn clean(&self) -> bool {
        self.scatterers.iter().all(|s| s.clean())
    }

    /// `clean()` of each type, in registration order.
    #[must_use]
    pub fn clean_states(&self) -> Vec<(TypeTag, bool)> {
        self.scatterers
            .iter()
            .map(|s| (s.type_tag(), s.clean()))
            .collect()
    }

    /// Elements in the shared buffer of `tag`.
    #[must_use]
    pub fn buffered_of(&self, tag: TypeTag) -> Option<usize> {
        self.by_tag.get(&tag).map(|&i| self.scatterers[i].buffered())
    }

    /// Elements in all shared buffers.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.scatterers.iter().map(|s| s.buffered()).sum()
    }

    /// Whether `tag` had paths and none of them is still open.
    #[must_use]
    pub fn finished(&self, tag: TypeTag) -> Option<bool> {
        self.by_tag.get(&tag).map(|&i| self.scatterers[i].finished())
    }

    /// Starts a graceful close of every path of `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnregisteredType`] if nothing is registered
    /// under `tag`.
    pub fn close_type(&mut self, tag: TypeTag) -> Result<(), StreamError> {
        let i = *self
            .by_tag
            .get(&tag)
            .ok_or(StreamError::UnregisteredType(tag))?;
        self.scatterers[i].close_all();
        Ok(())
    }

    /// Looks up an outbound path by slot.
    #[must_use]
    pub fn path(&self, slot: SlotId) -> Option<&Path> {
        let &i = self.by_slot.get(&slot)?;
        self.scatterers[i].path(slot)
    }

    /// Looks up an outbound path by slot for modification.
    pub fn path_mut(&mut self, slot: SlotId) -> Option<&mut Path> {
        let &i = self.by_slot.get(&slot)?;
        self.scatterers[i].path_mut(slot)
    }

    /// Returns `true` if `slot` names an outbound path, closed or not.
    #[must_use]
    pub fn contains_slot(&self, slot: SlotId) -> bool {
        self.by_slot.contains_key(&slot)
    }

    /// Every outbound path, including closed ones.
    pub fn paths(&self) -> impl Iterator<Item = &Path> + '_ {
        self.scatterers.iter().flat_map(|s| s.paths())
    }

    /// Discards the queue of an outbound path. See [`Scatterer::take_pending`].
    pub fn take_pending(&mut self, slot: SlotId) -> Option<usize> {
        let &i = self.by_slot.get(&slot)?;
        self.scatterers[i].take_pending(slot)
    }

    /// Discards the queue of an outbound path and closes it.
    pub fn abort_path(&mut self, slot: SlotId) -> Option<usize> {
        let &i = self.by_slot.get(&slot)?;
        self.scatterers[i].abort_path(slot)
    }

    /// Dispatches every type.
    pub fn dispatch(&mut self, now: Duration) -> DispatchOutcome<P> {
        let mut outcome = DispatchOutcome::default();
        for s in &mut self.scatterers {
            outcome.append(s.dispatch(now));
        }
        outcome
    }
}
