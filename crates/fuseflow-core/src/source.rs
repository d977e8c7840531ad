//! Pull-based producer stage.
//!
//! A source is a [`Stage`] with a single output type `T` and no input. It is
//! built from three callbacks:
//!
//! - `init(&mut state)` runs once at construction,
//! - `pull(&mut state, &mut scatterer, n)` pushes up to `n` elements,
//! - `is_done(&state)` reports that nothing more will come.
//!
//! `pull` is only invoked while the output has capacity, so a source never
//! produces faster than its slowest consumer grants credit. Once `is_done`
//! holds and everything pushed has been dispatched, the output paths are
//! closed and the stage finishes.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::StageConfig;
use crate::error::StreamError;
use crate::fused::FusedScatterer;
use crate::path::{SlotId, StageId};
use crate::payload::{Element, Payload, TypeTag};
use crate::scatterer::Scatterer;
use crate::stage::{Stage, StageBuilder, StageLogic};

type PullFn<T, S> = Box<dyn FnMut(&mut S, &mut Scatterer<T>, usize) + Send>;
type IsDoneFn<S> = Box<dyn Fn(&S) -> bool + Send>;

/// Stage logic of a source.
pub struct SourceLogic<T, S> {
    state: S,
    pull: PullFn<T, S>,
    is_done: IsDoneFn<S>,
    _elements: PhantomData<fn() -> T>,
}

/// A stage producing elements of `T` from state `S`.
pub type SourceStage<P, T, S> = Stage<P, SourceLogic<T, S>>;

impl<T, S> SourceLogic<T, S> {
    /// The producer state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Returns `true` once the producer reports it is done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        (self.is_done)(&self.state)
    }
}

impl<T, S: fmt::Debug> fmt::Debug for SourceLogic<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceLogic")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<P, T, S> StageLogic<P> for SourceLogic<T, S>
where
    P: Payload,
    T: Element<P>,
    S: Send + 'static,
{
    fn accepts(&self, _tag: TypeTag, _out: &FusedScatterer<P>) -> bool {
        false
    }

    fn on_batch(
        &mut self,
        slot: SlotId,
        payload: P,
        _out: &mut FusedScatterer<P>,
    ) -> Result<(), StreamError> {
        Err(StreamError::TypeMismatch {
            slot,
            actual: payload.type_tag(),
        })
    }

    fn generate(&mut self, out: &mut FusedScatterer<P>) {
        if self.is_done() {
            return;
        }
        let Ok(scatterer) = out.get_mut::<T>() else {
            return;
        };
        let n = scatterer.capacity();
        if n > 0 {
            (self.pull)(&mut self.state, scatterer, n);
        }
    }

    fn input_exhausted(&self, _tag: TypeTag, _inbound_of_tag: usize) -> bool {
        self.is_done()
    }

    fn keep_alive(&self) -> bool {
        !self.is_done()
    }
}

/// Builds a source stage.
///
/// The state starts as `S::default()` and is handed to `init` once.
///
/// # Errors
///
/// Returns [`StreamError::InvalidConfig`] if `config` does not validate.
pub fn make_source<P, T, S>(
    id: StageId,
    config: StageConfig,
    clock: Arc<dyn Clock>,
    init: impl FnOnce(&mut S),
    pull: impl FnMut(&mut S, &mut Scatterer<T>, usize) + Send + 'static,
    is_done: impl Fn(&S) -> bool + Send + 'static,
) -> Result<SourceStage<P, T, S>, StreamError>
where
    P: Payload,
    T: Element<P>,
    S: Default + Send + 'static,
{
    let mut state = S::default();
    init(&mut state);
    StageBuilder::new(id)
        .config(config)
        .clock(clock)
        .output::<T>()
        .build_with(SourceLogic {
            state,
            pull: Box::new(pull),
            is_done: Box::new(is_done),
            _elements: PhantomData,
        })
}
