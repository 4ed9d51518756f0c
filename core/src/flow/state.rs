//! Open/close state of both halves of a stream.
//!
//! Guards such as `initial_opening && !initial_closed` are exposed as named
//! predicates so every `*_if_necessary` helper checks the same conditions.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Half {
    opening: bool,
    opened: bool,
    closing: bool,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamState {
    initial: Half,
    reply: Half,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_opening(&self) -> bool {
        self.initial.opening
    }

    pub fn initial_opened(&self) -> bool {
        self.initial.opened
    }

    pub fn initial_closing(&self) -> bool {
        self.initial.closing
    }

    pub fn initial_closed(&self) -> bool {
        self.initial.closed
    }

    pub fn reply_opening(&self) -> bool {
        self.reply.opening
    }

    pub fn reply_opened(&self) -> bool {
        self.reply.opened
    }

    pub fn reply_closing(&self) -> bool {
        self.reply.closing
    }

    pub fn reply_closed(&self) -> bool {
        self.reply.closed
    }

    /// Both halves closed.
    pub fn closed(&self) -> bool {
        self.initial.closed && self.reply.closed
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    pub fn open_initial(&mut self) {
        self.initial.opening = true;
    }

    pub fn opened_initial(&mut self) {
        self.initial.opening = true;
        self.initial.opened = true;
    }

    pub fn closing_initial(&mut self) {
        self.initial.closing = true;
    }

    pub fn close_initial(&mut self) {
        self.initial.closing = true;
        self.initial.closed = true;
    }

    pub fn open_reply(&mut self) {
        self.reply.opening = true;
    }

    pub fn opened_reply(&mut self) {
        self.reply.opening = true;
        self.reply.opened = true;
    }

    pub fn closing_reply(&mut self) {
        self.reply.closing = true;
    }

    pub fn close_reply(&mut self) {
        self.reply.closing = true;
        self.reply.closed = true;
    }

    /// Back to idle, as for a stream that was never opened.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halves_are_independent() {
        let mut state = StreamState::new();
        assert!(state.is_idle());

        state.open_initial();
        assert!(state.initial_opening());
        assert!(!state.initial_opened());
        assert!(!state.reply_opening());

        state.opened_reply();
        state.close_initial();
        assert!(state.initial_closed());
        assert!(!state.closed());

        state.close_reply();
        assert!(state.closed());

        state.reset();
        assert!(state.is_idle());
    }

    #[test]
    fn test_close_implies_closing() {
        let mut state = StreamState::new();
        state.close_reply();
        assert!(state.reply_closing());
        assert!(state.reply_closed());
    }
}
