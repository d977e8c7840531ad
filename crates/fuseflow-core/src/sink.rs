//! Push-based consumer stage.
//!
//! A sink binds exactly one inbound path of type `T`. Every element is fed
//! to `step` in arrival order and `finalize` runs exactly once when that
//! path closes, whether gracefully or by abort. Further handshakes are
//! refused.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::config::StageConfig;
use crate::error::StreamError;
use crate::fused::FusedScatterer;
use crate::path::{SlotId, StageId};
use crate::payload::{Element, Payload, TypeTag};
use crate::stage::{Stage, StageBuilder, StageLogic};

type StepFn<T, S> = Box<dyn FnMut(&mut S, T) + Send>;
type FinalizeFn<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Stage logic of a sink.
pub struct SinkLogic<T, S> {
    state: S,
    step: StepFn<T, S>,
    finalize: Option<FinalizeFn<S>>,
    bound: Option<SlotId>,
}

/// A stage consuming elements of `T` into state `S`.
pub type SinkStage<P, T, S> = Stage<P, SinkLogic<T, S>>;

impl<T, S> SinkLogic<T, S> {
    /// The consumer state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Slot of the bound inbound path, if any.
    #[must_use]
    pub fn bound(&self) -> Option<SlotId> {
        self.bound
    }

    /// Returns `true` once `finalize` has run.
    #[must_use]
    pub fn finalized(&self) -> bool {
        self.finalize.is_none()
    }
}

impl<T, S: fmt::Debug> fmt::Debug for SinkLogic<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkLogic")
            .field("state", &self.state)
            .field("bound", &self.bound)
            .field("finalized", &self.finalized())
            .finish_non_exhaustive()
    }
}

impl<P, T, S> StageLogic<P> for SinkLogic<T, S>
where
    P: Payload,
    T: Element<P>,
    S: Send + 'static,
{
    fn accepts(&self, tag: TypeTag, _out: &FusedScatterer<P>) -> bool {
        tag == T::TAG
    }

    fn on_inbound_open(&mut self, slot: SlotId, _tag: TypeTag) -> bool {
        if self.bound.is_some() || self.finalized() {
            return false;
        }
        self.bound = Some(slot);
        true
    }

    fn on_batch(
        &mut self,
        slot: SlotId,
        payload: P,
        _out: &mut FusedScatterer<P>,
    ) -> Result<(), StreamError> {
        let items = T::unwrap(payload).map_err(|payload| StreamError::TypeMismatch {
            slot,
            actual: payload.type_tag(),
        })?;
        for item in items {
            (self.step)(&mut self.state, item);
        }
        Ok(())
    }

    fn on_inbound_closed(&mut self, slot: SlotId, _tag: TypeTag, aborted: bool) {
        if self.bound != Some(slot) {
            return;
        }
        if let Some(finalize) = self.finalize.take() {
            debug!(%slot, aborted, "sink finalized");
            finalize(&mut self.state);
        }
    }

    fn keep_alive(&self) -> bool {
        !self.finalized()
    }
}

/// Builds a sink stage.
///
/// The state starts as `S::default()` and is handed to `init` once.
///
/// # Errors
///
/// Returns [`StreamError::InvalidConfig`] if `config` does not validate.
pub fn make_sink<P, T, S>(
    id: StageId,
    config: StageConfig,
    clock: Arc<dyn Clock>,
    init: impl FnOnce(&mut S),
    step: impl FnMut(&mut S, T) + Send + 'static,
    finalize: impl FnOnce(&mut S) + Send + 'static,
) -> Result<SinkStage<P, T, S>, StreamError>
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
        .build_with(SinkLogic {
            state,
            step: Box::new(step),
            finalize: Some(Box::new(finalize)),
            bound: None,
        })
}
