//! Shadow levels: nested speculative scopes whose mutations are undone on exit.
//!
//! A [`ShadowStack`] tracks the current level and the undo records registered
//! at each open level. A [`ShadowedValue`] keeps one slot's snapshot stack.
//! [`ShadowScope`] pushes a level on any [`ShadowStateManager`] and pops it
//! again when dropped.

use std::ops::{Deref, DerefMut};

/// Nesting depth of speculative execution. Level 0 is live state.
pub type ShadowLevel = u32;

/// A component that can open and close shadow levels.
pub trait ShadowStateManager {
    fn shadow_level(&self) -> ShadowLevel;

    /// Open a new level. `level` must equal the current level plus one.
    fn push_state(&mut self, level: ShadowLevel);

    /// Close the current level, applying its undo records. `level` must
    /// equal the current level.
    fn pop_state(&mut self, level: ShadowLevel);

    fn is_shadowed(&self) -> bool {
        self.shadow_level() > 0
    }
}

/// Per-level undo records, applied in registration order on pop.
#[derive(Debug)]
pub struct ShadowStack<U> {
    level: ShadowLevel,
    pending: Vec<Vec<U>>,
}

impl<U> Default for ShadowStack<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U> ShadowStack<U> {
    pub fn new() -> Self {
        Self {
            level: 0,
            pending: Vec::new(),
        }
    }

    pub fn level(&self) -> ShadowLevel {
        self.level
    }

    /// Open a level. Panics if `expected` is not the new level.
    pub fn push(&mut self, expected: ShadowLevel) {
        self.pending.push(Vec::new());
        self.level += 1;
        assert_eq!(
            self.level, expected,
            "shadow level mismatch on push: stack is at {}, caller expected {}",
            self.level, expected
        );
    }

    /// Record an undo for the current level.
    ///
    /// Panics at level 0: live state has nothing to undo.
    pub fn register(&mut self, undo: U) {
        let Some(current) = self.pending.last_mut() else {
            panic!("undo registered with no open shadow level");
        };
        current.push(undo);
    }

    /// Close the current level and hand back its undo records in
    /// registration order. Panics if `expected` is not the current level.
    pub fn pop(&mut self, expected: ShadowLevel) -> Vec<U> {
        assert_eq!(
            self.level, expected,
            "shadow level mismatch on pop: stack is at {}, caller expected {}",
            self.level, expected
        );
        let Some(undos) = self.pending.pop() else {
            panic!("shadow pop with no open level");
        };
        self.level -= 1;
        undos
    }
}

/// A value saved when a slot was first written at a deeper level.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowState<T> {
    /// The level at which the replacement happened.
    pub level: ShadowLevel,
    pub value: T,
}

/// A slot with its own snapshot stack. Snapshot levels strictly increase.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowedValue<T> {
    value: T,
    base_level: ShadowLevel,
    shadows: Vec<ShadowState<T>>,
}

impl<T> ShadowedValue<T> {
    pub fn new(value: T) -> Self {
        Self::new_at(0, value)
    }

    /// A slot that came into existence inside shadow level `level`.
    pub fn new_at(level: ShadowLevel, value: T) -> Self {
        Self {
            value,
            base_level: level,
            shadows: Vec::new(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// The level the current value belongs to.
    pub fn level(&self) -> ShadowLevel {
        self.shadows.last().map_or(self.base_level, |s| s.level)
    }

    /// The value as it was before any open shadow level touched it.
    pub fn original(&self) -> &T {
        self.shadows.first().map_or(&self.value, |s| &s.value)
    }

    pub fn depth(&self) -> usize {
        self.shadows.len()
    }

    /// Every value held, oldest snapshot first and the current value last.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.shadows
            .iter()
            .map(|s| &s.value)
            .chain(std::iter::once(&self.value))
    }

    /// Store `value` at `store_level`.
    ///
    /// Returns `true` when the previous value was snapshotted, in which case
    /// the caller must register an undo for this slot at `store_level`.
    pub fn set(&mut self, store_level: ShadowLevel, value: T) -> bool {
        let own = self.level();
        if store_level > own {
            let previous = std::mem::replace(&mut self.value, value);
            self.shadows.push(ShadowState {
                level: store_level,
                value: previous,
            });
            true
        } else {
            debug_assert_eq!(
                store_level, own,
                "shadowed value written at level {store_level} while holding level {own}"
            );
            self.value = value;
            false
        }
    }

    /// Undo the snapshot taken at `store_level`, returning the discarded value.
    pub fn pop(&mut self, store_level: ShadowLevel) -> Option<T> {
        let top = self.shadows.last()?;
        debug_assert_eq!(
            top.level, store_level,
            "shadowed value popped at level {store_level} but its top snapshot is level {}",
            top.level
        );
        let restored = self.shadows.pop()?;
        Some(std::mem::replace(&mut self.value, restored.value))
    }
}

/// Holds one shadow level open on `T` for as long as it lives.
pub struct ShadowScope<'a, T: ShadowStateManager> {
    target: &'a mut T,
    level: ShadowLevel,
}

impl<'a, T: ShadowStateManager> ShadowScope<'a, T> {
    pub fn enter(target: &'a mut T) -> Self {
        let level = target.shadow_level() + 1;
        target.push_state(level);
        Self { target, level }
    }

    pub fn level(&self) -> ShadowLevel {
        self.level
    }
}

impl<T: ShadowStateManager> Deref for ShadowScope<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.target
    }
}

impl<T: ShadowStateManager> DerefMut for ShadowScope<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.target
    }
}

impl<T: ShadowStateManager> Drop for ShadowScope<'_, T> {
    fn drop(&mut self) {
        self.target.pop_state(self.level);
    }
}
