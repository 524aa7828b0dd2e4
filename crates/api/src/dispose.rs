//! Ownership-transferring release for objects a module hands to the host.
//!
//! Modules, sessions and content handlers are created by a module but owned by
//! the server. They are released by calling [`Dispose::dispose`], never by a
//! bare drop from host code. [`Owned`] wraps the box so that every path that
//! lets go of such an object, including early returns and unwinding, routes
//! through `dispose` exactly once.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

/// Self-release capability.
///
/// The default implementation simply drops the object. Implementors override
/// it when releasing needs more than `Drop`, e.g. reaping a child process.
pub trait Dispose {
    fn dispose(self: Box<Self>) {}
}

/// A box whose contents are released through [`Dispose::dispose`].
pub struct Owned<T: ?Sized + Dispose> {
    inner: ManuallyDrop<Box<T>>,
}

impl<T: ?Sized + Dispose> Owned<T> {
    pub fn new(inner: Box<T>) -> Self {
        Self { inner: ManuallyDrop::new(inner) }
    }

    /// Releases the object now.
    pub fn release(self) {
        drop(self);
    }
}

impl<T: Dispose> Owned<T> {
    pub fn from_value(value: T) -> Self {
        Self::new(Box::new(value))
    }
}

impl<T: ?Sized + Dispose> From<Box<T>> for Owned<T> {
    fn from(inner: Box<T>) -> Self {
        Self::new(inner)
    }
}

impl<T: ?Sized + Dispose> Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized + Dispose> DerefMut for Owned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: ?Sized + Dispose> Drop for Owned<T> {
    fn drop(&mut self) {
        // SAFETY: `inner` is taken exactly once, here, and never touched again.
        let inner = unsafe { ManuallyDrop::take(&mut self.inner) };
        inner.dispose();
    }
}

impl<T: ?Sized + Dispose> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned").finish_non_exhaustive()
    }
}

/// Moves a concrete value into an [`Owned`] trait object.
///
/// ```ignore
/// let handler: Owned<dyn ContentHandler> = owned!(HelloContent::default());
/// ```
#[macro_export]
macro_rules! owned {
    ($value:expr) => {
        $crate::Owned::new(::std::boxed::Box::new($value))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Named: Dispose {
        fn name(&self) -> &str;
    }

    struct Tracked {
        disposed: Arc<AtomicUsize>,
    }

    impl Named for Tracked {
        fn name(&self) -> &str {
            "tracked"
        }
    }

    impl Dispose for Tracked {
        fn dispose(self: Box<Self>) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_disposes_once() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let owned: Owned<dyn Named> = Owned::new(Box::new(Tracked { disposed: Arc::clone(&disposed) }));
        assert_eq!(owned.name(), "tracked");
        drop(owned);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_disposes_once() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let owned = Owned::from_value(Tracked { disposed: Arc::clone(&disposed) });
        owned.release();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_owned_macro() {
        let disposed = Arc::new(AtomicUsize::new(0));
        {
            let _owned: Owned<dyn Named> = crate::owned!(Tracked { disposed: Arc::clone(&disposed) });
        }
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }
}
