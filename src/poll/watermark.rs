//! Per-device record watermarks

use std::collections::HashMap;

/// Last processed record timestamp per device
///
/// Values only ever move forward.
#[derive(Debug, Default, Clone)]
pub struct Watermarks {
    marks: HashMap<String, i64>,
}

impl Watermarks {
    /// Current watermark, 0 for unseen devices
    #[must_use]
    pub fn get(&self, device_id: &str) -> i64 {
        self.marks.get(device_id).copied().unwrap_or(0)
    }

    /// Advance to `timestamp` if it is strictly newer
    ///
    /// Returns whether the record at `timestamp` should be processed.
    pub fn advance(&mut self, device_id: &str, timestamp: i64) -> bool {
        let mark = self.marks.entry(device_id.to_string()).or_insert(0);
        if timestamp <= *mark {
            return false;
        }
        *mark = timestamp;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_timestamp_is_not_processed_twice() {
        let mut w = Watermarks::default();
        assert_eq!(w.get("a"), 0);
        assert!(w.advance("a", 1000));
        assert_eq!(w.get("a"), 1000);
        assert!(!w.advance("a", 1000));
    }

    #[test]
    fn never_moves_backwards() {
        let mut w = Watermarks::default();
        let mut last = 0;
        for ts in [5, 3, 9, 9, 1, 12, 0] {
            w.advance("a", ts);
            assert!(w.get("a") >= last);
            last = w.get("a");
        }
        assert_eq!(w.get("a"), 12);
    }

    #[test]
    fn devices_are_independent() {
        let mut w = Watermarks::default();
        assert!(w.advance("a", 10));
        assert!(w.advance("b", 5));
        assert_eq!(w.get("a"), 10);
        assert_eq!(w.get("b"), 5);
    }
}
