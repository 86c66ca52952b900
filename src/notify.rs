// =============================================================================
// Notification Sink — best-effort operator alerts
// =============================================================================
//
// The engine never blocks a decision path on delivery.  Implementations must
// return immediately; anything slow belongs behind a channel inside the
// implementation.  The default sink writes structured log lines, which is
// where an external chat relay picks them up.
// =============================================================================

use tracing::{error, info, warn};

/// String-payload alert sink.  Delivery is best-effort.
pub trait Notifier: Send + Sync {
    fn send_trade(&self, message: &str);
    fn send_error(&self, message: &str);
    fn send_risk_alert(&self, message: &str);
    fn send_kill_switch(&self, message: &str);
}

/// Default sink: structured log lines tagged by alert class.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_trade(&self, message: &str) {
        info!(alert = "trade", "{message}");
    }

    fn send_error(&self, message: &str) {
        error!(alert = "error", "{message}");
    }

    fn send_risk_alert(&self, message: &str) {
        warn!(alert = "risk", "{message}");
    }

    fn send_kill_switch(&self, message: &str) {
        warn!(alert = "kill_switch", "{message}");
    }
}

#[cfg(test)]
pub mod testing {
    use super::Notifier;
    use parking_lot::Mutex;

    /// Records every alert for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub trades: Mutex<Vec<String>>,
        pub errors: Mutex<Vec<String>>,
        pub risk_alerts: Mutex<Vec<String>>,
        pub kill_switches: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn send_trade(&self, message: &str) {
            self.trades.lock().push(message.to_string());
        }

        fn send_error(&self, message: &str) {
            self.errors.lock().push(message.to_string());
        }

        fn send_risk_alert(&self, message: &str) {
            self.risk_alerts.lock().push(message.to_string());
        }

        fn send_kill_switch(&self, message: &str) {
            self.kill_switches.lock().push(message.to_string());
        }
    }
}
