use std::collections::HashSet;

use thiserror::Error;

/// Reasons for refusing a sender at `MAIL FROM`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Invalid email from: {0}")]
    SenderNotAllowed(String),
}

/// Sender allow-list applied before any message data is read.
///
/// An empty list admits every sender.
#[derive(Debug, Clone, Default)]
pub struct SenderPolicy {
    whitelist: HashSet<String>,
}

impl SenderPolicy {
    pub fn new<I, S>(whitelist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            whitelist: whitelist
                .into_iter()
                .map(Into::into)
                .map(|address| address.trim().to_string())
                .filter(|address| !address.is_empty())
                .collect(),
        }
    }

    pub fn is_restricted(&self) -> bool {
        !self.whitelist.is_empty()
    }

    pub fn admit_sender(&self, address: &str) -> Result<(), AdmissionError> {
        if self.whitelist.is_empty() || self.whitelist.contains(address) {
            Ok(())
        } else {
            Err(AdmissionError::SenderNotAllowed(address.to_string()))
        }
    }
}
