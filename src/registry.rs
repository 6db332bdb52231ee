//! Process-wide handle registry.
//!
//! Native code never receives a Rust reference. Each per-call context (scan
//! accumulator, compiler diagnostics, stream reader or writer) is boxed,
//! stored here under a freshly minted integer token, and the token travels
//! through the engine as the callback's `user_data` word. The callback
//! resolves the token back to the context.
//!
//! # Locking
//!
//! The table is split into [`SHARD_COUNT`] independently locked shards chosen
//! by `token % SHARD_COUNT`. `put`, `get` and `delete` each hold a single
//! shard lock for one hash map operation. Token minting is a lock-free
//! counter; a minted value that is still live (only possible after the
//! counter wraps) is skipped.
//!
//! # Lifecycle
//!
//! The registry is created on first use and lives until process exit.
//! Entries are added and removed per operation by [`Registered`].

use crate::error::{BridgeError, Result};
use std::cell::Cell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

/// Opaque token handed to native code in place of a pointer.
pub type Token = usize;

pub const SHARD_COUNT: usize = 16;

/// Kind tag checked on every lookup so a token can never be resolved to a
/// context of the wrong type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextKind {
    Scan,
    Compile,
    Reader,
    Writer,
}

/// A value that can be registered for native callbacks.
pub(crate) trait Context {
    const KIND: ContextKind;
}

struct Slot {
    ptr: NonNull<()>,
    kind: ContextKind,
}

// Slots are only dereferenced by the callback of the operation that owns them.
unsafe impl Send for Slot {}

pub struct HandleRegistry {
    shards: [Mutex<HashMap<Token, Slot>>; SHARD_COUNT],
    next: AtomicUsize,
}

static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();

/// The process-wide registry.
pub fn registry() -> &'static HandleRegistry {
    REGISTRY.get_or_init(HandleRegistry::new)
}

impl HandleRegistry {
    fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
            next: AtomicUsize::new(1),
        }
    }

    fn shard(&self, token: Token) -> MutexGuard<'_, HashMap<Token, Slot>> {
        self.shards[token % SHARD_COUNT]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn put<T: Context>(&self, value: NonNull<T>) -> Token {
        loop {
            // Zero would read as a null user_data pointer on the native side.
            let token = self.next.fetch_add(1, Ordering::Relaxed);
            if token == 0 {
                continue;
            }
            let mut shard = self.shard(token);
            if let Entry::Vacant(entry) = shard.entry(token) {
                entry.insert(Slot {
                    ptr: value.cast(),
                    kind: T::KIND,
                });
                return token;
            }
        }
    }

    pub(crate) fn get<T: Context>(&self, token: Token) -> Result<NonNull<T>> {
        let shard = self.shard(token);
        match shard.get(&token) {
            Some(slot) if slot.kind == T::KIND => Ok(slot.ptr.cast()),
            _ => Err(BridgeError::UnknownToken(token)),
        }
    }

    pub(crate) fn delete(&self, token: Token) -> bool {
        self.shard(token).remove(&token).is_some()
    }

    /// Whether `token` currently resolves to a context.
    pub fn contains(&self, token: Token) -> bool {
        self.shard(token).contains_key(&token)
    }

    /// Number of live tokens across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A context registered for the duration of one operation.
///
/// The context is boxed so its address is stable while native code holds the
/// token. Dropping the guard (or calling [`Registered::into_inner`]) removes
/// the token before the box is freed, so a late callback finds no entry
/// instead of freed memory.
pub(crate) struct Registered<T: Context> {
    token: Token,
    value: NonNull<T>,
    _owns: PhantomData<Box<T>>,
}

impl<T: Context> Registered<T> {
    pub(crate) fn new(value: T) -> Self {
        let value = NonNull::from(Box::leak(Box::new(value)));
        let token = registry().put(value);
        tracing::trace!(token, kind = ?T::KIND, "registered callback context");
        Self {
            token,
            value,
            _owns: PhantomData,
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    /// The token encoded as the native `user_data` word.
    pub(crate) fn user_data(&self) -> *mut c_void {
        self.token as *mut c_void
    }

    /// Shared access while no native call using this token is in flight.
    pub(crate) fn get(&self) -> &T {
        unsafe { self.value.as_ref() }
    }

    /// Exclusive access while no native call using this token is in flight.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        unsafe { self.value.as_mut() }
    }

    /// Unregister and hand the context back to the caller.
    pub(crate) fn into_inner(self) -> T {
        let this = std::mem::ManuallyDrop::new(self);
        registry().delete(this.token);
        tracing::trace!(token = this.token, "released callback context");
        *unsafe { Box::from_raw(this.value.as_ptr()) }
    }
}

impl<T: Context> Drop for Registered<T> {
    fn drop(&mut self) {
        registry().delete(self.token);
        drop(unsafe { Box::from_raw(self.value.as_ptr()) });
    }
}

unsafe impl<T: Context + Send> Send for Registered<T> {}

/// Resolve a native `user_data` word to the context registered under it.
///
/// # Safety
/// The returned reference must not outlive the native call that delivered
/// `user_data`, and no other reference to the same context may be live.
pub(crate) unsafe fn resolve<'a, T: Context>(user_data: *mut c_void) -> Result<&'a mut T> {
    let token = user_data as Token;
    let mut ptr = registry().get::<T>(token)?;
    Ok(ptr.as_mut())
}

thread_local! {
    static UNRESOLVED: Cell<Option<Token>> = const { Cell::new(None) };
}

/// Record that a callback running on this thread was handed `token` and
/// could not resolve it. Only the first such token per watched call is kept.
pub(crate) fn note_unresolved(token: Token) {
    UNRESOLVED.with(|slot| {
        if slot.get().is_none() {
            slot.set(Some(token));
        }
    });
}

/// Run a native call and report the first token its callbacks failed to
/// resolve. Callbacks are expected on the calling thread; nested watches
/// keep their own record.
pub(crate) fn watch_unresolved<R>(call: impl FnOnce() -> R) -> (R, Option<Token>) {
    let outer = UNRESOLVED.with(Cell::take);
    let result = call();
    let unresolved = UNRESOLVED.with(|slot| slot.replace(outer));
    (result, unresolved)
}
