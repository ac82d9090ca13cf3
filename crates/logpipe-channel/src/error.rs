// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced to producers from the channel entry points.
///
/// Transport outcomes never surface here: producers are fully decoupled from
/// delivery, which is reported through lifecycle events instead.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is disabled")]
    Disabled,

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("channel is shutting down")]
    ShuttingDown,
}

/// Errors from the durable log store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt journal: {0}")]
    Corrupt(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("unknown batch: {0}")]
    UnknownBatch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ChannelError::UnknownGroup("crashes".to_string());
        assert_eq!(error.to_string(), "unknown group: crashes");
    }

    #[test]
    fn test_store_error_wraps_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error = ChannelError::from(StoreError::from(io));
        assert!(error.to_string().contains("gone"));
    }
}
