// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Payment verification collaborator. The control plane only asks yes/no
//! before dispatch and mirrors a refusal's status and message verbatim to
//! the caller.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PaymentError {
    pub status: u16,
    pub message: String,
}

impl PaymentError {
    pub fn required(message: impl Into<String>) -> Self {
        Self {
            status: 402,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(&self, pipe_id: &str, token: Option<&str>) -> Result<(), PaymentError>;
}

/// Default when no prices are configured: everything is free.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPayment;

#[async_trait]
impl PaymentVerifier for NoopPayment {
    async fn verify(&self, _pipe_id: &str, _token: Option<&str>) -> Result<(), PaymentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_accepts_everything() {
        assert!(NoopPayment.verify("v--m--default", None).await.is_ok());
    }

    #[test]
    fn test_refusal_carries_status_and_message() {
        let err = PaymentError::required("payment token missing");
        assert_eq!(err.status, 402);
        assert_eq!(err.to_string(), "payment token missing");
    }
}
