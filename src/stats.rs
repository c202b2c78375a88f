//! Per-type live-instance counters, so pool and poller constructors can
//! report how many of a given type are currently alive without attaching
//! a profiler.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

static COUNTERS: Mutex<Option<HashMap<TypeId, &'static AtomicI64>>> = Mutex::new(None);

/// A per-type counter, incremented on construction and decremented on
/// drop via [`InstanceGuard`].
pub struct InstanceCounter<T: 'static> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: 'static> InstanceCounter<T> {
    /// Current live-instance count for `T`.
    pub fn count() -> i64 {
        counter_for::<T>().load(Ordering::Relaxed)
    }

    /// Construct a guard that increments the counter for `T` now and
    /// decrements it on drop.
    pub fn guard() -> InstanceGuard<T> {
        counter_for::<T>().fetch_add(1, Ordering::Relaxed);
        InstanceGuard {
            _marker: std::marker::PhantomData,
        }
    }
}

/// RAII guard produced by [`InstanceCounter::guard`]; decrements the
/// per-type counter when dropped.
pub struct InstanceGuard<T: 'static> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: 'static> Drop for InstanceGuard<T> {
    fn drop(&mut self) {
        counter_for::<T>().fetch_sub(1, Ordering::Relaxed);
    }
}

fn counter_for<T: 'static>() -> &'static AtomicI64 {
    let mut guard = COUNTERS.lock();
    let map = guard.get_or_insert_with(HashMap::new);
    *map.entry(TypeId::of::<T>())
        .or_insert_with(|| Box::leak(Box::new(AtomicI64::new(0))))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget;
    struct Gadget;

    #[test]
    fn counters_are_independent_per_type() {
        let before_widget = InstanceCounter::<Widget>::count();
        let before_gadget = InstanceCounter::<Gadget>::count();
        let g1 = InstanceCounter::<Widget>::guard();
        let g2 = InstanceCounter::<Widget>::guard();
        assert_eq!(InstanceCounter::<Widget>::count(), before_widget + 2);
        assert_eq!(InstanceCounter::<Gadget>::count(), before_gadget);
        drop(g1);
        assert_eq!(InstanceCounter::<Widget>::count(), before_widget + 1);
        drop(g2);
        assert_eq!(InstanceCounter::<Widget>::count(), before_widget);
    }
}
