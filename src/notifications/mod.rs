//! Outbound email.
//!
//! Account flows only need one operation from the delivery side. It reports
//! failure as `false` instead of an error so that a code or link that was
//! already stored is never lost because a provider was down.

pub mod email;

pub use email::{EmailMessage, SmtpMailer};

use async_trait::async_trait;

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_message(&self, to: &str, subject: &str, html: &str, text: &str) -> bool;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone)]
    pub struct SentMessage {
        pub to: String,
        pub subject: String,
        pub text: String,
    }

    /// Keeps every message in memory
    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<SentMessage>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingMailer {
        pub fn last_to(&self, to: &str) -> Option<SentMessage> {
            self.sent.lock().iter().rev().find(|m| m.to == to).cloned()
        }

        /// First run of six digits in the last message sent to `to`
        pub fn last_code_to(&self, to: &str) -> Option<String> {
            let text = self.last_to(to)?.text;
            let re = regex::Regex::new(r"\b(\d{6})\b").ok()?;
            re.captures(&text).map(|c| c[1].to_string())
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send_message(&self, to: &str, subject: &str, _html: &str, text: &str) -> bool {
            self.sent.lock().push(SentMessage {
                to: to.to_string(),
                subject: subject.to_string(),
                text: text.to_string(),
            });
            !self.fail.load(std::sync::atomic::Ordering::Relaxed)
        }
    }
}
