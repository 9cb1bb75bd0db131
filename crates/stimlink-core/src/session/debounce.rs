//! Switch debouncing
//!
//! Edge-to-edge "prompt" debounce: a falling edge counts as a genuine
//! closure when the time since the previous edge exceeds the window. The
//! prior-edge timestamp is updated on every edge, debounced or not, so the
//! window is measured edge-to-edge rather than edge-to-stable.

/// Outcome of one falling edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Edge rejected as electrical bounce
    Bounce,
    /// Genuine closure
    Genuine {
        /// First closure since the last reset
        first: bool,
        /// Closure count including this one
        count: u32,
    },
}

/// Debounced physical switch state for one device
#[derive(Debug, Clone)]
pub struct DebouncedSwitch {
    window_ms: u64,
    prior_edge_ms: Option<u64>,
    first_pending: bool,
    count: u32,
}

impl DebouncedSwitch {
    /// New switch with the given debounce window
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            prior_edge_ms: None,
            first_pending: true,
            count: 0,
        }
    }

    /// Update the debounce window (config `DBNC`/`dbc`)
    pub fn set_window_ms(&mut self, window_ms: u64) {
        self.window_ms = window_ms;
    }

    /// Genuine closures since the last reset
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Forget the first-closure flag and counter. The prior-edge timestamp
    /// is kept so bounce suppression spans trial boundaries.
    pub fn reset(&mut self) {
        self.first_pending = true;
        self.count = 0;
    }

    /// Record a falling edge observed at `now_ms` on the session clock
    pub fn on_falling_edge(&mut self, now_ms: u64) -> Closure {
        let genuine = match self.prior_edge_ms {
            Some(prior) => now_ms.saturating_sub(prior) > self.window_ms,
            None => true,
        };
        self.prior_edge_ms = Some(now_ms);
        if !genuine {
            return Closure::Bounce;
        }
        self.count += 1;
        let first = self.first_pending;
        self.first_pending = false;
        Closure::Genuine {
            first,
            count: self.count,
        }
    }
}
