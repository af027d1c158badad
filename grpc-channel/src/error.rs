/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Error types for the client channel.

use thiserror::Error;
use tonic::{Code, Status};

/// Error type for channel operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The channel has been closed by [`ClientConn::close`].
    ///
    /// [`ClientConn::close`]: crate::client::ClientConn::close
    #[error("grpc: the client connection is closing")]
    ClientConnClosing,
    /// The subchannel has been shut down.
    #[error("grpc: the connection is closing")]
    ConnClosing,
    /// The subchannel was shut down because the channel entered idle mode.
    #[error("grpc: the connection is closing due to channel idleness")]
    ConnIdling,
    /// The subchannel was removed by the load balancing policy; its transport
    /// is closed gracefully.
    #[error("grpc: the connection is drained")]
    ConnDrain,
    /// The resolver produced an update that could not be applied.
    #[error("bad resolver state")]
    BadResolverState,
    #[error("grpc: the provided default service config is invalid: {0}")]
    InvalidDefaultServiceConfig(String),
    #[error("grpc: invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("grpc: could not get resolver for scheme: {0:?}")]
    NoResolver(String),
    #[error("grpc: failed to build resolver: {0}")]
    ResolverBuild(String),
    #[error("grpc: no transport configured for the channel")]
    NoTransport,
    #[error("grpc: registry is frozen; cannot register {0:?}")]
    RegistryFrozen(String),
    #[error("grpc: connection error: {0}")]
    Connection(String),
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Status(#[from] Status),
}

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The gRPC status code an RPC fails with when it encounters this error.
    pub fn code(&self) -> Code {
        match self {
            Error::ClientConnClosing | Error::Canceled => Code::Cancelled,
            Error::DeadlineExceeded => Code::DeadlineExceeded,
            Error::InvalidTarget { .. } | Error::InvalidDefaultServiceConfig(_) => {
                Code::InvalidArgument
            }
            Error::NoResolver(_) | Error::NoTransport | Error::RegistryFrozen(_) => {
                Code::Internal
            }
            Error::Status(s) => s.code(),
            _ => Code::Unavailable,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Status(s) => s,
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_maps_to_canceled() {
        let s: Status = Error::ClientConnClosing.into();
        assert_eq!(s.code(), Code::Cancelled);
        assert_eq!(s.message(), "grpc: the client connection is closing");
    }

    #[test]
    fn status_passes_through() {
        let s: Status = Error::Status(Status::permission_denied("nope")).into();
        assert_eq!(s.code(), Code::PermissionDenied);
        assert_eq!(s.message(), "nope");
    }

    #[test]
    fn context_errors_keep_their_codes() {
        assert_eq!(Error::Canceled.code(), Code::Cancelled);
        assert_eq!(Error::DeadlineExceeded.code(), Code::DeadlineExceeded);
        assert_eq!(Error::ConnIdling.code(), Code::Unavailable);
    }
}
