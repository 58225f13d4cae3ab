use std::time::Instant;

/// A message tagged with the time it was received or sent.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage<T> {
    /// Received/Sent time
    pub now: Instant,
    /// Message body with generic type
    pub message: T,
}

impl<T> TransportMessage<T> {
    pub fn new(now: Instant, message: T) -> Self {
        Self { now, message }
    }

    /// Replace the message body, keeping its time.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TransportMessage<U> {
        TransportMessage {
            now: self.now,
            message: f(self.message),
        }
    }
}
