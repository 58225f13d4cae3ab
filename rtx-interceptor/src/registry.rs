//! Interceptor Registry - Type-safe builder for constructing interceptor chains.

use crate::noop::NoopInterceptor;
use crate::Interceptor;

/// Registry for constructing interceptor chains.
///
/// `Registry` wraps an interceptor chain and allows adding more interceptors
/// via the [`with`](Registry::with) method. The chain can be extracted with [`build`](Registry::build).
///
/// # Example
///
/// ```ignore
/// use rtx_interceptor::Registry;
///
/// // Create a new registry and add interceptors (can be done in helper functions)
/// let registry = Registry::new()
///     .with(RtxReceiveBuilder::new().with_payload_type_map(pt_map).build());
///
/// // Build the final chain
/// let chain = registry.build();
/// ```
///
/// # Helper Function Pattern
///
/// ```ignore
/// fn register_rtx_interceptors<P: Interceptor>(
///     registry: Registry<P>,
///     pt_map: PayloadTypeMap,
/// ) -> Registry<impl Interceptor> {
///     registry
///         .with(RtxQueueBuilder::new().with_payload_type_map(pt_map.clone()).build())
///         .with(RtxReceiveBuilder::new().with_payload_type_map(pt_map).build())
/// }
///
/// let registry = Registry::new();
/// let registry = register_rtx_interceptors(registry, [(96, 106)].into());
/// let chain = registry.build();
/// ```
pub struct Registry<P> {
    inner: P,
}

impl Registry<NoopInterceptor> {
    /// Create a new empty registry.
    ///
    /// This creates a `NoopInterceptor` as the innermost layer.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use rtx_interceptor::Registry;
    ///
    /// let registry = Registry::new();
    /// ```
    pub fn new() -> Self {
        Registry {
            inner: NoopInterceptor::new(),
        }
    }
}

impl Default for Registry<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Interceptor> Registry<P> {
    /// Create a registry from an existing interceptor.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let custom = MyCustomInterceptor::new();
    /// let registry = Registry::from(custom);
    /// ```
    pub fn from(inner: P) -> Self {
        Registry { inner }
    }

    /// Wrap the current chain with another interceptor.
    ///
    /// Returns a new `Registry` with the updated chain type.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let registry = Registry::new()
    ///     .with(RtxReceiveBuilder::new().with_payload_type_map(pt_map.clone()).build())
    ///     .with(RtxQueueBuilder::new().with_payload_type_map(pt_map).build());
    /// ```
    pub fn with<O, F>(self, f: F) -> Registry<O>
    where
        F: FnOnce(P) -> O,
        O: Interceptor,
    {
        Registry {
            inner: f(self.inner),
        }
    }

    /// Build and return the interceptor chain.
    ///
    /// Consumes the registry and returns the inner interceptor chain.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let registry = Registry::new().with(RtxReceiveBuilder::new().build());
    /// let chain = registry.build();
    /// ```
    pub fn build(self) -> P {
        self.inner
    }
}
