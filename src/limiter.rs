// =============================================================================
// Rate Limiter — per-endpoint sliding window with burst guard
// =============================================================================
//
// Each endpoint class keeps its own 60 s sliding window of admitted request
// instants plus a 10 s burst sub-window capped at a quarter of the minute
// budget.  Budgets are the venue's documented per-minute allowance divided by
// an engine-wide safety divisor (>= 5); order endpoints use a stricter
// divisor (>= 10).
//
// `allow` records the request on admission.  Denial is backpressure: callers
// skip the tick and try again later, they do not treat it as an error.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::LimitsConfig;

/// Sliding window length.
const WINDOW: Duration = Duration::from_secs(60);
/// Burst sub-window length.
const BURST_WINDOW: Duration = Duration::from_secs(10);

/// Endpoint classes the engine distinguishes for admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tickers,
    Klines,
    Depth,
    Positions,
    Orders,
    Leverage,
}

impl Endpoint {
    const ALL: [Endpoint; 6] = [
        Self::Tickers,
        Self::Klines,
        Self::Depth,
        Self::Positions,
        Self::Orders,
        Self::Leverage,
    ];

    fn index(self) -> usize {
        match self {
            Self::Tickers => 0,
            Self::Klines => 1,
            Self::Depth => 2,
            Self::Positions => 3,
            Self::Orders => 4,
            Self::Leverage => 5,
        }
    }

    fn is_order_class(self) -> bool {
        matches!(self, Self::Orders | Self::Leverage)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Tickers => "tickers",
            Self::Klines => "klines",
            Self::Depth => "depth",
            Self::Positions => "positions",
            Self::Orders => "orders",
            Self::Leverage => "leverage",
        };
        write!(f, "{name}")
    }
}

struct Window {
    admitted: VecDeque<Instant>,
    per_minute: u32,
    per_burst: u32,
}

impl Window {
    fn new(per_minute: u32) -> Self {
        Self {
            admitted: VecDeque::new(),
            per_minute,
            per_burst: (per_minute / 4).max(1),
        }
    }

    fn try_admit(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.admitted.front() {
            if now.duration_since(front) >= WINDOW {
                self.admitted.pop_front();
            } else {
                break;
            }
        }

        if self.admitted.len() >= self.per_minute as usize {
            return false;
        }

        let burst_count = self
            .admitted
            .iter()
            .rev()
            .take_while(|&&t| now.duration_since(t) < BURST_WINDOW)
            .count();
        if burst_count >= self.per_burst as usize {
            return false;
        }

        self.admitted.push_back(now);
        true
    }
}

/// Internally synchronized per-endpoint admission control.
pub struct RateLimiter {
    windows: [Mutex<Window>; 6],
}

impl RateLimiter {
    /// Build from the configured venue budgets, applying the safety divisors.
    /// Divisors below the floor (5 for reads, 10 for orders) are clamped up.
    pub fn new(limits: &LimitsConfig) -> Self {
        let read_divisor = limits.safety_divisor.max(5);
        let order_divisor = limits.order_safety_divisor.max(10);

        let read_budget = (limits.read_rpm / read_divisor).max(1);
        let order_budget = (limits.order_rpm / order_divisor).max(1);

        debug!(
            read_budget,
            order_budget, read_divisor, order_divisor, "rate limiter configured"
        );

        let window_for = |ep: Endpoint| {
            Mutex::new(Window::new(if ep.is_order_class() {
                order_budget
            } else {
                read_budget
            }))
        };

        Self {
            windows: Endpoint::ALL.map(window_for),
        }
    }

    /// Admit or deny a request against `endpoint`'s budget, recording it on
    /// admission.
    pub fn allow(&self, endpoint: Endpoint) -> bool {
        self.allow_at(endpoint, Instant::now())
    }

    fn allow_at(&self, endpoint: Endpoint, now: Instant) -> bool {
        let admitted = self.windows[endpoint.index()].lock().try_admit(now);
        if !admitted {
            warn!(endpoint = %endpoint, "rate limiter denied request — backing off");
        }
        admitted
    }
}
