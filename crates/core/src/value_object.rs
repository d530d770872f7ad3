//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// A value object has no identity and is never mutated in place; a
/// `RetryPolicy` or a `JobInput` is replaced, not edited.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
