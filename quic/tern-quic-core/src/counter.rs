// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{cmp::Ordering, marker::PhantomData, ops};

/// A checked-overflow counter
///
/// Rather than silently wrapping, we want to ensure counting errors stay somewhat isolated so the
/// counter will saturate rather than wrap. The counter operates in 3 modes:
///
/// * If `debug_assertions` are enabled, the counter will panic on overflow
/// * If the `checked-counters` feature flag is defined, the counter will panic on overflow, even in
///   release builds.
/// * Otherwise, the counter will saturate
///
/// The counter can also be configured to always saturate by passing the `Saturating` behavior:
///
/// ```rust
/// use tern_quic_core::counter::{Counter, Saturating};
///
/// let counter: Counter<u32, Saturating> = Default::default();
/// ```
#[derive(Clone, Copy, Debug, Default, Hash)]
pub struct Counter<T, Behavior = ()>(T, PhantomData<Behavior>);

/// Overrides the behavior of a counter to always saturate
#[derive(Clone, Copy, Debug, Default, Hash)]
pub struct Saturating;

impl<T, Behavior> Counter<T, Behavior> {
    /// Creates a new counter with an initial value
    #[inline]
    pub const fn new(value: T) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    pub fn set(&mut self, value: T) {
        self.0 = value;
    }
}

macro_rules! counter_impl {
    ($ty:ident) => {
        impl<Behavior> Counter<$ty, Behavior> {
            /// Tries to add `value` to the current counter value, failing on overflow
            #[inline]
            pub fn try_add(&mut self, value: $ty) -> Result<(), ()> {
                self.0 = self.0.checked_add(value).ok_or(())?;
                Ok(())
            }

            /// Tries to subtract `value` from the current counter value, failing on underflow
            #[inline]
            pub fn try_sub(&mut self, value: $ty) -> Result<(), ()> {
                self.0 = self.0.checked_sub(value).ok_or(())?;
                Ok(())
            }
        }

        impl ops::AddAssign<$ty> for Counter<$ty, ()> {
            #[inline]
            fn add_assign(&mut self, rhs: $ty) {
                if cfg!(any(debug_assertions, feature = "checked-counters")) {
                    self.0 = self.0.checked_add(rhs).expect("counter overflow");
                } else {
                    self.0 = self.0.saturating_add(rhs);
                }
            }
        }

        impl ops::SubAssign<$ty> for Counter<$ty, ()> {
            #[inline]
            fn sub_assign(&mut self, rhs: $ty) {
                if cfg!(any(debug_assertions, feature = "checked-counters")) {
                    self.0 = self.0.checked_sub(rhs).expect("counter underflow");
                } else {
                    self.0 = self.0.saturating_sub(rhs);
                }
            }
        }

        impl ops::AddAssign<$ty> for Counter<$ty, Saturating> {
            #[inline]
            fn add_assign(&mut self, rhs: $ty) {
                self.0 = self.0.saturating_add(rhs);
            }
        }

        impl ops::SubAssign<$ty> for Counter<$ty, Saturating> {
            #[inline]
            fn sub_assign(&mut self, rhs: $ty) {
                self.0 = self.0.saturating_sub(rhs);
            }
        }
    };
}

counter_impl!(u8);
counter_impl!(u16);
counter_impl!(u32);
counter_impl!(u64);
counter_impl!(usize);

impl<T, Behavior> ops::Deref for Counter<T, Behavior> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: PartialEq, Behavior> PartialEq<T> for Counter<T, Behavior> {
    #[inline]
    fn eq(&self, other: &T) -> bool {
        self.0.eq(other)
    }
}

impl<T: PartialOrd, Behavior> PartialOrd<T> for Counter<T, Behavior> {
    #[inline]
    fn partial_cmp(&self, other: &T) -> Option<Ordering> {
        self.0.partial_cmp(other)
    }
}

impl<T: PartialEq, BehaviorA, BehaviorB> PartialEq<Counter<T, BehaviorB>> for Counter<T, BehaviorA> {
    #[inline]
    fn eq(&self, other: &Counter<T, BehaviorB>) -> bool {
        self.0.eq(&other.0)
    }
}

impl<T: Eq> Eq for Counter<T, ()> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_counter() {
        let mut counter: Counter<u8, Saturating> = Counter::new(0);
        counter += 250;
        counter += 10;
        assert_eq!(*counter, 255);
        counter -= 255;
        counter -= 1;
        assert_eq!(*counter, 0);
    }

    #[test]
    fn try_ops() {
        let mut counter: Counter<u32> = Counter::new(u32::MAX - 1);
        assert!(counter.try_add(1).is_ok());
        assert!(counter.try_add(1).is_err());
        assert_eq!(*counter, u32::MAX);
        assert!(counter.try_sub(u32::MAX).is_ok());
        assert!(counter.try_sub(1).is_err());
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn checked_counter_panics_on_underflow() {
        let mut counter: Counter<u32> = Counter::new(0);
        counter -= 1;
    }
}
