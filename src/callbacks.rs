// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Token-received / token-sent callback registry.
//!
//! A capability set `{on_token_received, on_token_sent}` over registered
//! subscribers, extended with the create/destroy/auto-delete semantics
//! the protocol's original callback-token API exposes: a callback may be
//! one-shot (`auto_delete`) or persistent, and can be deregistered by its
//! handle at any time.

/// Which token event a callback fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCallbackKind {
    Received,
    Sent,
}

/// Opaque handle returned by [`CallbackRegistry::register`]; pass to
/// [`CallbackRegistry::unregister`] to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

struct Entry {
    handle: CallbackHandle,
    kind: TokenCallbackKind,
    auto_delete: bool,
    callback: Box<dyn FnMut()>,
}

/// Registry of token-event subscribers. Owned exclusively by the event
/// loop, like every other piece of ring state.
#[derive(Default)]
pub struct CallbackRegistry {
    next_handle: u64,
    entries: Vec<Entry>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` to fire on every token event of `kind`. If
    /// `auto_delete` is set, the callback is removed immediately after its
    /// first invocation.
    pub fn register(
        &mut self,
        kind: TokenCallbackKind,
        auto_delete: bool,
        callback: impl FnMut() + 'static,
    ) -> CallbackHandle {
        let handle = CallbackHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push(Entry {
            handle,
            kind,
            auto_delete,
            callback: Box::new(callback),
        });
        handle
    }

    /// Cancel a previously registered callback. No-op if already fired
    /// and auto-deleted, or already unregistered.
    pub fn unregister(&mut self, handle: CallbackHandle) {
        self.entries.retain(|e| e.handle != handle);
    }

    /// Invoke every callback registered for `kind`, removing the
    /// auto-delete ones afterward.
    pub fn fire(&mut self, kind: TokenCallbackKind) {
        for entry in &mut self.entries {
            if entry.kind == kind {
                (entry.callback)();
            }
        }
        self.entries.retain(|e| !(e.kind == kind && e.auto_delete));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn persistent_callback_fires_every_time() {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let mut reg = CallbackRegistry::new();
        reg.register(TokenCallbackKind::Received, false, move || c.set(c.get() + 1));
        reg.fire(TokenCallbackKind::Received);
        reg.fire(TokenCallbackKind::Received);
        assert_eq!(count.get(), 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn auto_delete_fires_once() {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let mut reg = CallbackRegistry::new();
        reg.register(TokenCallbackKind::Sent, true, move || c.set(c.get() + 1));
        reg.fire(TokenCallbackKind::Sent);
        reg.fire(TokenCallbackKind::Sent);
        assert_eq!(count.get(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn unregister_prevents_further_firing() {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let mut reg = CallbackRegistry::new();
        let handle = reg.register(TokenCallbackKind::Received, false, move || c.set(c.get() + 1));
        reg.unregister(handle);
        reg.fire(TokenCallbackKind::Received);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn kinds_are_independent() {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let mut reg = CallbackRegistry::new();
        reg.register(TokenCallbackKind::Sent, false, move || c.set(c.get() + 1));
        reg.fire(TokenCallbackKind::Received);
        assert_eq!(count.get(), 0);
    }
}
