//! Opaque value-transport seam.
//!
//! The core never marshalls JavaScript values itself. Callers hand it
//! already-marshalled payload bytes plus an opaque [`TransportContext`];
//! both are passed through to the engine collaborator untouched. The
//! [`TransportCodec`] trait is the seam engine implementations plug their
//! serializer into.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Opaque handle threaded from the submitter through the core to the
/// marshalling collaborator.
///
/// Typically carries shared-buffer externalization state. The core only
/// clones and forwards it; the concrete type is known to the codec alone.
#[derive(Clone)]
pub struct TransportContext(Arc<dyn Any + Send + Sync>);

impl TransportContext {
    /// Wrap a codec-specific context object.
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    /// Downcast back to the codec's concrete type.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportContext(..)")
    }
}

/// Marshalling failure reported by a codec.
#[derive(Debug, thiserror::Error)]
#[error("transport codec error: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Value codec consumed by engine implementations.
///
/// `Value` is the engine's native value representation; the core never
/// names it.
pub trait TransportCodec {
    type Value;

    /// Serialize an engine value into transportable bytes.
    fn marshall(
        &self,
        value: &Self::Value,
        context: Option<&TransportContext>,
    ) -> Result<Bytes, TransportError>;

    /// Reconstruct an engine value from transported bytes.
    fn unmarshall(
        &self,
        bytes: &[u8],
        context: Option<&TransportContext>,
    ) -> Result<Self::Value, TransportError>;
}
