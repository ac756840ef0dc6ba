//! Opaque, transformable payload carried through the filter chain.
//!
//! The engine does not know the application's wire format. A filter may replace
//! the bytes it receives with a decoded request object, and the next filter in
//! line sees that object instead. `Message` is the type-erased container that
//! makes this possible without the chain itself depending on a concrete protocol.

use std::any::Any;
use std::fmt;

/// A single value flowing through the filter chain in either direction.
pub struct Message(Box<dyn Any + Send + Sync>);

impl Message {
    /// Wraps `value` as a chain message.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Message(Box::new(value))
    }

    /// Attempts to downcast the message back into a concrete type, consuming it.
    ///
    /// Returns the original message unchanged if `T` does not match.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<T, Self> {
        match self.0.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            Err(boxed) => Err(Message(boxed)),
        }
    }

    /// Borrows the message as `T`, or `None` if it holds a different type.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Mutably borrows the message as `T`, or `None` if it holds a different type.
    pub fn downcast_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut::<T>()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Message").field(&"..").finish()
    }
}

impl From<bytes::Bytes> for Message {
    fn from(bytes: bytes::Bytes) -> Self {
        Message::new(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_concrete_type() {
        let msg = Message::new(42u32);
        assert_eq!(msg.downcast::<u32>().unwrap(), 42);
    }

    #[test]
    fn downcast_failure_returns_original() {
        let msg = Message::new(String::from("abc"));
        let msg = msg.downcast::<u32>().unwrap_err();
        assert_eq!(msg.downcast_ref::<String>().unwrap(), "abc");
    }

    #[test]
    fn bytes_convert_via_from() {
        let msg: Message = bytes::Bytes::from_static(b"ping").into();
        assert_eq!(msg.downcast_ref::<bytes::Bytes>().unwrap(), "ping");
    }
}
