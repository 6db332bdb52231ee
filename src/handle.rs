//! Ownership wrapper for native engine handles.
//!
//! An [`OwnedHandle`] holds exactly one native handle and the engine that
//! issued it. Its state moves `Bound -> Released` once and never back:
//!
//! - operations run under the shared lock and fail with
//!   [`BridgeError::UseAfterRelease`] once the handle is gone;
//! - [`OwnedHandle::release`] takes the exclusive lock, so it waits for
//!   operations in flight and destroys the native handle exactly once;
//! - dropping a still-bound wrapper releases it as a backstop.
//!
//! Sharing is done by wrapping the handle in an `Arc`; the last reference to
//! go away runs the backstop.

use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::ffi::{self, EngineApi, RawCompiler, RawRules};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::{Arc, PoisonError, RwLock};

/// A family of native handles sharing one destroy function.
pub(crate) trait HandleKind {
    type Raw;
    const LABEL: &'static str;

    /// # Safety
    /// `raw` must be a live handle of this kind issued by `api`'s engine.
    unsafe fn destroy(api: &EngineApi, raw: *mut Self::Raw);
}

pub(crate) struct RulesKind;

impl HandleKind for RulesKind {
    type Raw = RawRules;
    const LABEL: &'static str = "rules";

    unsafe fn destroy(api: &EngineApi, raw: *mut RawRules) {
        let status = (api.rules_destroy)(raw);
        if status != ffi::ERROR_SUCCESS {
            tracing::warn!(status, "native rules destroy reported failure");
        }
    }
}

pub(crate) struct CompilerKind;

impl HandleKind for CompilerKind {
    type Raw = RawCompiler;
    const LABEL: &'static str = "compiler";

    unsafe fn destroy(api: &EngineApi, raw: *mut RawCompiler) {
        (api.compiler_destroy)(raw);
    }
}

enum HandleState<R> {
    Bound(NonNull<R>),
    Released,
}

pub(crate) struct OwnedHandle<K: HandleKind> {
    state: RwLock<HandleState<K::Raw>>,
    engine: Arc<Engine>,
    _kind: PhantomData<K>,
}

// The native handle is only touched through the engine's entry points, under
// the state lock.
unsafe impl<K: HandleKind> Send for OwnedHandle<K> {}
// Scanning a compiled ruleset does not mutate it.
unsafe impl Sync for OwnedHandle<RulesKind> {}

impl<K: HandleKind> OwnedHandle<K> {
    /// Take ownership of `raw`.
    ///
    /// # Safety
    /// `raw` must have been issued by `engine` and must not be owned by any
    /// other wrapper.
    pub(crate) unsafe fn bind(engine: Arc<Engine>, raw: *mut K::Raw) -> Result<Self> {
        let raw = NonNull::new(raw).ok_or_else(|| {
            BridgeError::InvalidArgument(format!("engine returned a null {} handle", K::LABEL))
        })?;
        tracing::trace!(kind = K::LABEL, "bound native handle");
        Ok(Self {
            state: RwLock::new(HandleState::Bound(raw)),
            engine,
            _kind: PhantomData,
        })
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run `f` with the live handle under the shared lock.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&EngineApi, *mut K::Raw) -> R) -> Result<R> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            HandleState::Bound(raw) => Ok(f(self.engine.api(), raw.as_ptr())),
            HandleState::Released => Err(BridgeError::UseAfterRelease),
        }
    }

    /// Destroy the native handle. Returns `false` if it was already released.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, HandleState::Released) {
            HandleState::Bound(raw) => {
                unsafe { K::destroy(self.engine.api(), raw.as_ptr()) };
                tracing::debug!(kind = K::LABEL, "released native handle");
                true
            }
            HandleState::Released => false,
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(PoisonError::into_inner),
            HandleState::Released
        )
    }
}

impl<K: HandleKind> Drop for OwnedHandle<K> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let HandleState::Bound(raw) = std::mem::replace(state, HandleState::Released) {
            tracing::warn!(
                kind = K::LABEL,
                engine = %self.engine.label(),
                "native handle released by drop without explicit release"
            );
            unsafe { K::destroy(self.engine.api(), raw.as_ptr()) };
        }
    }
}

impl<K: HandleKind> fmt::Debug for OwnedHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("kind", &K::LABEL)
            .field("engine", &self.engine.label())
            .field("released", &self.is_released())
            .finish()
    }
}
