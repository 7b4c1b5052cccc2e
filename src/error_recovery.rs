use crate::error::{AudioError, CatalogError, DecodeError, FetchError, PlayerError};
use log::{info, warn};

/// What the engine does about an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Try the same operation again against another backend instance
    Retry,
    /// Abandon the current track and advance the queue
    SkipTrack(String),
    /// Stop playback and surface the problem to the control layer
    Fault(String),
    /// Nothing to do
    Ignore,
}

impl RecoveryAction {
    pub fn is_retry(&self) -> bool {
        matches!(self, RecoveryAction::Retry)
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, RecoveryAction::SkipTrack(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, RecoveryAction::Fault(_))
    }
}

/// Maps errors onto recovery actions.
///
/// Fetch and decode errors are local to one track and always end in a
/// skip; only output device errors stop playback.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    retry_budget: u32,
}

impl RecoveryPolicy {
    pub fn new(retry_budget: u32) -> Self {
        Self {
            retry_budget: retry_budget.max(1),
        }
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Decide what to do after `attempt` (1-based) failed with `error`
    pub fn on_fetch_error(&self, error: &FetchError, attempt: u32) -> RecoveryAction {
        if matches!(error, FetchError::Cancelled) {
            return RecoveryAction::Ignore;
        }

        if error.is_transient() && attempt < self.retry_budget {
            info!(
                "Retrying transfer (attempt {} of {}): {}",
                attempt + 1,
                self.retry_budget,
                error
            );
            return RecoveryAction::Retry;
        }

        warn!("Transfer failed permanently after {} attempts: {}", attempt, error);
        RecoveryAction::SkipTrack(error.user_message())
    }

    pub fn on_decode_error(&self, error: &DecodeError) -> RecoveryAction {
        match error {
            DecodeError::ResourceExhaustion { requested } => {
                warn!("Aborting track, cannot buffer {} more samples", requested);
                RecoveryAction::SkipTrack(error.user_message())
            }
            DecodeError::CodecCorruption(_) | DecodeError::UnsupportedStream(_) => {
                RecoveryAction::SkipTrack(error.user_message())
            }
        }
    }

    pub fn on_audio_error(&self, error: &AudioError) -> RecoveryAction {
        RecoveryAction::Fault(error.user_message())
    }

    /// Classify any error reaching the engine's event loop
    pub fn classify(&self, error: &PlayerError) -> RecoveryAction {
        match error {
            PlayerError::Audio(err) => self.on_audio_error(err),
            PlayerError::Fetch(err) => match err {
                FetchError::Cancelled => RecoveryAction::Ignore,
                _ => RecoveryAction::SkipTrack(err.user_message()),
            },
            PlayerError::Decode(err) => self.on_decode_error(err),
            PlayerError::Catalog(CatalogError::Fetch(FetchError::Cancelled)) => RecoveryAction::Ignore,
            PlayerError::Catalog(_) | PlayerError::Cache(_) | PlayerError::Queue(_) => {
                RecoveryAction::Ignore
            }
            PlayerError::Config(_) | PlayerError::Parse(_) | PlayerError::File(_) => {
                RecoveryAction::Ignore
            }
            PlayerError::EngineStopped => RecoveryAction::Fault(error.user_message()),
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_retry_within_budget() {
        let policy = RecoveryPolicy::new(3);
        let error = FetchError::TransientNetwork("connection reset".into());

        assert!(policy.on_fetch_error(&error, 1).is_retry());
        assert!(policy.on_fetch_error(&error, 2).is_retry());
        assert!(policy.on_fetch_error(&error, 3).is_skip());
    }

    #[test]
    fn test_malformed_response_takes_retry_path() {
        let policy = RecoveryPolicy::default();
        let error = FetchError::MalformedResponse("HTTP 502".into());
        assert!(policy.on_fetch_error(&error, 1).is_retry());
    }

    #[test]
    fn test_non_transient_fetch_errors_skip_immediately() {
        let policy = RecoveryPolicy::default();
        assert!(policy.on_fetch_error(&FetchError::NoBackends, 1).is_skip());
        assert_eq!(policy.on_fetch_error(&FetchError::Cancelled, 1), RecoveryAction::Ignore);
    }

    #[test]
    fn test_decode_errors_are_track_local() {
        let policy = RecoveryPolicy::default();
        let corrupt = PlayerError::Decode(DecodeError::CodecCorruption("bad packet".into()));
        let oom = PlayerError::Decode(DecodeError::ResourceExhaustion { requested: 1 << 30 });

        assert!(policy.classify(&corrupt).is_skip());
        assert!(policy.classify(&oom).is_skip());
    }

    #[test]
    fn test_device_errors_fault_playback() {
        let policy = RecoveryPolicy::default();
        let error = PlayerError::Audio(AudioError::DeviceError("device unplugged".into()));
        assert!(policy.classify(&error).is_fault());
    }

    #[test]
    fn test_budget_is_at_least_one() {
        assert_eq!(RecoveryPolicy::new(0).retry_budget(), 1);
    }
}
