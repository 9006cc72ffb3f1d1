use std::sync::Arc;

/// Callbacks registered on an [`Observable`](crate::Observable).
pub struct Observer<T> {
    pub(crate) next: Arc<dyn Fn(&T) + Send + Sync>,
    pub(crate) complete: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<T> Observer<T> {
    pub fn new<F>(next: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            next: Arc::new(next),
            complete: None,
        }
    }

    /// Also run `f` once when the stream completes or closes.
    pub fn with_complete<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.complete = Some(Arc::new(f));
        self
    }
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            next: Arc::clone(&self.next),
            complete: self.complete.clone(),
        }
    }
}

impl<T> core::fmt::Debug for Observer<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Observer")
            .field("has_complete", &self.complete.is_some())
            .finish()
    }
}
