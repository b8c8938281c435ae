use std::future::Future;

/// The computation whose results are cached.
///
/// The cache invokes [`compute`](Self::compute) at most once per key and miss episode, on a task
/// spawned onto the Tokio runtime and without holding any lock, and shares the result with every
/// concurrent caller for the same key.
///
/// The trait is implemented for any `Fn(K) -> impl Future<Output = Result<V, E>>`, so a closure or
/// an `async fn` can be used directly.
pub trait ComputeFunction<K>: Send + Sync + 'static {
    /// The value produced by a successful computation.
    type Value: Clone + Send + Sync + 'static;
    /// The error produced by a failed computation. It is memoized like a value.
    type Error: Clone + Send + Sync + 'static;
    /// The computation Future type.
    type Computation: Future<Output = Result<Self::Value, Self::Error>> + Send + 'static;

    /// Computes the value for `key`.
    fn compute(&self, key: K) -> Self::Computation;
}

impl<K, F, Fut, V, E> ComputeFunction<K> for F
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Value = V;
    type Error = E;
    type Computation = Fut;

    fn compute(&self, key: K) -> Self::Computation {
        self(key)
    }
}
