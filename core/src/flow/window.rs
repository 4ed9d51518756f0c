//! Credit window of one half stream.
//!
//! `acknowledge <= sequence <= acknowledge + maximum` holds at all times. A
//! window that would break it is reported as a [`FlowError`] and never
//! clamped.

use super::FlowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamWindow {
    pub sequence: i64,
    pub acknowledge: i64,
    pub maximum: i32,
    pub padding: i32,
    pub minimum: i32,
    pub budget_id: u64,
}

/// Outcome of reserving credit for an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Send `length` payload bytes charging `reserved` credit.
    Send { reserved: i32, length: usize },
    /// No room for payload yet.
    Defer,
}

impl StreamWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes sent but not yet acknowledged.
    pub fn pending(&self) -> i64 {
        self.sequence - self.acknowledge
    }

    /// Credit still available to the sender.
    pub fn budget(&self) -> i32 {
        (self.maximum as i64 - self.pending()).max(0) as i32
    }

    /// Applies an inbound Window; returns whether it opened the window.
    pub fn apply_window(
        &mut self,
        acknowledge: i64,
        maximum: i32,
        padding: i32,
        minimum: i32,
        budget_id: u64,
    ) -> Result<bool, FlowError> {
        if acknowledge > self.sequence {
            return Err(FlowError::AcknowledgeAhead {
                acknowledge,
                sequence: self.sequence,
            });
        }
        if acknowledge < self.acknowledge {
            return Err(FlowError::AcknowledgeRetreat {
                acknowledge,
                previous: self.acknowledge,
            });
        }
        if maximum < self.maximum {
            return Err(FlowError::MaximumRetreat {
                maximum,
                previous: self.maximum,
            });
        }

        let opened = self.maximum == 0 && maximum > 0;
        self.acknowledge = acknowledge;
        self.maximum = maximum;
        self.padding = padding;
        self.minimum = minimum;
        self.budget_id = budget_id;
        Ok(opened)
    }

    /// Computes the credit to grant the peer, keeping at most `min_no_ack`
    /// bytes unacknowledged. Returns `None` when nothing changed.
    pub fn compute_credit(
        &mut self,
        min_no_ack: i64,
        min_max: i32,
        opened: bool,
    ) -> Option<(i64, i32)> {
        let new_ack = (self.sequence - min_no_ack).max(self.acknowledge);
        let new_max = min_max.max(self.maximum);
        if new_ack > self.acknowledge || new_max > self.maximum || !opened {
            self.acknowledge = new_ack;
            self.maximum = new_max;
            Some((new_ack, new_max))
        } else {
            None
        }
    }

    /// Reserves credit for `length` payload bytes plus padding.
    pub fn reserve(&self, length: usize) -> Reservation {
        let budget = self.budget();
        let wanted = (length as i64 + self.padding as i64).min(i32::MAX as i64) as i32;
        let reserved = wanted.min(budget).max(self.minimum);
        if reserved < self.padding || (reserved == self.padding && length > 0) {
            return Reservation::Defer;
        }
        if reserved > budget {
            return Reservation::Defer;
        }
        let length = ((reserved - self.padding) as usize).min(length);
        Reservation::Send { reserved, length }
    }

    /// Charges an outbound frame against the window.
    pub fn sent(&mut self, reserved: i32) {
        self.sequence += reserved as i64;
    }

    /// Accounts an inbound frame; the sender must stay within our grant.
    pub fn on_data(&mut self, sequence: i64, reserved: i32) -> Result<(), FlowError> {
        if sequence < self.sequence {
            return Err(FlowError::SequenceRetreat {
                sequence,
                previous: self.sequence,
            });
        }
        if sequence + reserved as i64 > self.acknowledge + self.maximum as i64 {
            return Err(FlowError::WindowExceeded {
                sequence,
                reserved,
                acknowledge: self.acknowledge,
                maximum: self.maximum,
            });
        }
        self.sequence = sequence + reserved as i64;
        Ok(())
    }

    /// Zeroes the counters so a reopened stream starts fresh.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_window_opens_once() {
        let mut window = StreamWindow::new();
        assert!(window.apply_window(0, 8192, 0, 0, 0).unwrap());
        assert!(!window.apply_window(0, 8192, 0, 0, 0).unwrap());
        assert_eq!(window.budget(), 8192);
    }

    #[test]
    fn test_apply_window_rejects_retreat() {
        let mut window = StreamWindow::new();
        window.apply_window(0, 8192, 0, 0, 0).unwrap();
        window.sent(100);
        window.apply_window(50, 8192, 0, 0, 0).unwrap();

        assert!(matches!(
            window.apply_window(40, 8192, 0, 0, 0),
            Err(FlowError::AcknowledgeRetreat { .. })
        ));
        assert!(matches!(
            window.apply_window(50, 4096, 0, 0, 0),
            Err(FlowError::MaximumRetreat { .. })
        ));
        assert!(matches!(
            window.apply_window(200, 8192, 0, 0, 0),
            Err(FlowError::AcknowledgeAhead { .. })
        ));
    }

    #[test]
    fn test_compute_credit_is_edge_triggered() {
        let mut window = StreamWindow::new();
        assert_eq!(window.compute_credit(0, 1024, false), Some((0, 1024)));
        assert_eq!(window.compute_credit(0, 1024, true), None);

        window.on_data(0, 100).unwrap();
        assert_eq!(window.compute_credit(0, 1024, true), Some((100, 1024)));
        assert_eq!(window.compute_credit(0, 2048, true), Some((100, 2048)));
    }

    #[test]
    fn test_compute_credit_keeps_unacknowledged() {
        let mut window = StreamWindow::new();
        window.compute_credit(0, 1024, false);
        window.on_data(0, 600).unwrap();
        assert_eq!(window.compute_credit(200, 1024, true), Some((400, 1024)));
    }

    #[test]
    fn test_reserve() {
        let mut window = StreamWindow::new();
        window.apply_window(0, 100, 10, 0, 0).unwrap();

        assert_eq!(
            window.reserve(50),
            Reservation::Send {
                reserved: 60,
                length: 50
            }
        );
        assert_eq!(
            window.reserve(500),
            Reservation::Send {
                reserved: 100,
                length: 90
            }
        );

        window.sent(95);
        assert_eq!(window.reserve(1), Reservation::Defer);
    }

    #[test]
    fn test_on_data_enforces_window() {
        let mut window = StreamWindow::new();
        window.compute_credit(0, 100, false);
        window.on_data(0, 60).unwrap();
        assert!(matches!(
            window.on_data(60, 50),
            Err(FlowError::WindowExceeded { .. })
        ));
    }
}
