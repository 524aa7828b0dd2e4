//! Value-semantic callables with a fixed call signature.
//!
//! A [`Function<S>`] is either empty or holds exactly one target:
//!
//! - a free function pointer
//! - a functor (any closure or callable object) stored behind an [`Arc`]
//! - a method bound to a shared receiver
//!
//! The signature `S` is a zero-sized marker implementing [`Signature`]. Markers
//! are declared with the crate-internal `signature!` macro, which also generates
//! a `Function::<S>::new` constructor accepting any closure of that shape.
//!
//! Calling an empty function is not undefined behavior: [`Function::call`] returns
//! [`EmptyCallError`] and the caller decides what that means for its stage.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error returned when an empty [`Function`] is invoked.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("call to empty Function object")]
pub struct EmptyCallError;

/// Describes the argument list and return type of a [`Function`].
///
/// Arguments are passed as a tuple so one trait covers every arity. The lifetime
/// on [`Signature::Args`] lets signatures borrow their arguments, e.g. a handler
/// receiving `&mut HttpResponse`.
pub trait Signature: 'static {
    /// Argument tuple, possibly borrowing for `'a`.
    type Args<'a>;

    /// Return type.
    type Output;

    /// Free function pointer of this shape.
    type FnPtr: Copy + Send + Sync + 'static;

    /// Unsized callable object of this shape.
    type Dyn: ?Sized + Send + Sync + 'static;

    /// Method pointer taking `&T` as its receiver.
    type Method<T: Send + Sync + 'static>: Copy + Send + Sync + 'static;

    fn call_fn<'a>(f: Self::FnPtr, args: Self::Args<'a>) -> Self::Output;

    fn call_dyn<'a>(f: &Self::Dyn, args: Self::Args<'a>) -> Self::Output;

    fn call_method<'a, T: Send + Sync + 'static>(
        receiver: &T,
        method: Self::Method<T>,
        args: Self::Args<'a>,
    ) -> Self::Output;
}

/// Declares a [`Signature`] marker and a `Function::<Marker>::new` constructor.
///
/// ```ignore
/// signature! {
///     /// Connection gate.
///     pub struct ConnectionHandlerSig<'a> = fn(response: &'a mut HttpResponse, env: &'a Environment) -> bool;
/// }
/// ```
macro_rules! signature {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident<$lt:lifetime> = fn($($arg:ident: $ty:ty),* $(,)?) -> $ret:ty;
    ) => {
        $(#[$meta])*
        #[derive(Debug)]
        $vis enum $name {}

        impl $crate::function::Signature for $name {
            type Args<$lt> = ($($ty,)*);
            type Output = $ret;
            type FnPtr = for<$lt> fn($($ty),*) -> $ret;
            type Dyn = dyn for<$lt> Fn($($ty),*) -> $ret + Send + Sync;
            type Method<T: Send + Sync + 'static> = for<$lt> fn(&T, $($ty),*) -> $ret;

            #[inline]
            fn call_fn<$lt>(f: Self::FnPtr, ($($arg,)*): Self::Args<$lt>) -> $ret {
                f($($arg),*)
            }

            #[inline]
            fn call_dyn<$lt>(f: &Self::Dyn, ($($arg,)*): Self::Args<$lt>) -> $ret {
                f($($arg),*)
            }

            #[inline]
            fn call_method<$lt, T: Send + Sync + 'static>(
                receiver: &T,
                method: Self::Method<T>,
                ($($arg,)*): Self::Args<$lt>,
            ) -> $ret {
                method(receiver, $($arg),*)
            }
        }

        impl $crate::function::Function<$name> {
            /// Wraps a closure or callable object as the target.
            pub fn new<F>(f: F) -> Self
            where
                F: for<$lt> Fn($($ty),*) -> $ret + Send + Sync + 'static,
            {
                Self::from_functor(::std::sync::Arc::new(f))
            }
        }
    };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident = fn($($arg:ident: $ty:ty),* $(,)?) -> $ret:ty;
    ) => {
        $(#[$meta])*
        #[derive(Debug)]
        $vis enum $name {}

        impl $crate::function::Signature for $name {
            type Args<'a> = ($($ty,)*);
            type Output = $ret;
            type FnPtr = fn($($ty),*) -> $ret;
            type Dyn = dyn Fn($($ty),*) -> $ret + Send + Sync;
            type Method<T: Send + Sync + 'static> = fn(&T, $($ty),*) -> $ret;

            #[inline]
            fn call_fn<'a>(f: Self::FnPtr, ($($arg,)*): Self::Args<'a>) -> $ret {
                f($($arg),*)
            }

            #[inline]
            fn call_dyn<'a>(f: &Self::Dyn, ($($arg,)*): Self::Args<'a>) -> $ret {
                f($($arg),*)
            }

            #[inline]
            fn call_method<'a, T: Send + Sync + 'static>(
                receiver: &T,
                method: Self::Method<T>,
                ($($arg,)*): Self::Args<'a>,
            ) -> $ret {
                method(receiver, $($arg),*)
            }
        }

        impl $crate::function::Function<$name> {
            /// Wraps a closure or callable object as the target.
            pub fn new<F>(f: F) -> Self
            where
                F: Fn($($ty),*) -> $ret + Send + Sync + 'static,
            {
                Self::from_functor(::std::sync::Arc::new(f))
            }
        }
    };
}

pub(crate) use signature;

/// Which kind of target a [`Function`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Empty,
    Free,
    Functor,
    Bound,
}

/// A copyable callable with signature `S`.
///
/// Cloning copies the target. Functors and bound receivers are shared through
/// an [`Arc`], so state they reach through interior mutability is shared too.
pub struct Function<S: Signature> {
    target: Target<S>,
}

enum Target<S: Signature> {
    Empty,
    Free(S::FnPtr),
    Functor(Arc<S::Dyn>),
    Bound(Arc<dyn BoundCall<S>>),
}

trait BoundCall<S: Signature>: Send + Sync {
    fn call<'a>(&self, args: S::Args<'a>) -> S::Output;
}

struct BoundMember<T: Send + Sync + 'static, S: Signature> {
    receiver: Arc<T>,
    method: S::Method<T>,
}

impl<T, S> BoundCall<S> for BoundMember<T, S>
where
    T: Send + Sync + 'static,
    S: Signature,
{
    #[inline]
    fn call<'a>(&self, args: S::Args<'a>) -> S::Output {
        S::call_method(&*self.receiver, self.method, args)
    }
}

impl<S: Signature> Function<S> {
    /// Creates a function with no target.
    pub const fn empty() -> Self {
        Self { target: Target::Empty }
    }

    /// Targets a free function.
    pub const fn from_fn(f: S::FnPtr) -> Self {
        Self { target: Target::Free(f) }
    }

    pub(crate) fn from_functor(f: Arc<S::Dyn>) -> Self {
        Self { target: Target::Functor(f) }
    }

    /// Targets `method` invoked on a shared `receiver`.
    pub fn bind<T: Send + Sync + 'static>(receiver: Arc<T>, method: S::Method<T>) -> Self {
        let bound: Arc<dyn BoundCall<S>> = Arc::new(BoundMember::<T, S> { receiver, method });
        Self { target: Target::Bound(bound) }
    }

    pub fn kind(&self) -> Kind {
        match self.target {
            Target::Empty => Kind::Empty,
            Target::Free(_) => Kind::Free,
            Target::Functor(_) => Kind::Functor,
            Target::Bound(_) => Kind::Bound,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self.target, Target::Empty)
    }

    /// Invokes the target with `args`.
    ///
    /// # Errors
    ///
    /// Returns [`EmptyCallError`] when no target is set.
    #[inline]
    pub fn call<'a>(&self, args: S::Args<'a>) -> Result<S::Output, EmptyCallError> {
        match &self.target {
            Target::Empty => Err(EmptyCallError),
            Target::Free(f) => Ok(S::call_fn(*f, args)),
            Target::Functor(f) => Ok(S::call_dyn(f, args)),
            Target::Bound(bound) => Ok(bound.call(args)),
        }
    }
}

impl<S: Signature> Default for Function<S> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<S: Signature> Clone for Function<S> {
    fn clone(&self) -> Self {
        let target = match &self.target {
            Target::Empty => Target::Empty,
            Target::Free(f) => Target::Free(*f),
            Target::Functor(f) => Target::Functor(Arc::clone(f)),
            Target::Bound(bound) => Target::Bound(Arc::clone(bound)),
        };
        Self { target }
    }
}

impl<S: Signature> fmt::Debug for Function<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function").field("kind", &self.kind()).finish()
    }
}
