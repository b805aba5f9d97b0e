use flowline_common::Service;

/// Builds a fresh service. Called once per process, inside the child.
pub trait ServiceFactory: Send + Sync {
    fn create_service(&self) -> anyhow::Result<Box<dyn Service>>;
}

/// [`ServiceFactory`] backed by a closure.
pub struct FnServiceFactory<F> {
    func: F,
}

impl<F> FnServiceFactory<F>
where
    F: Fn() -> anyhow::Result<Box<dyn Service>> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> ServiceFactory for FnServiceFactory<F>
where
    F: Fn() -> anyhow::Result<Box<dyn Service>> + Send + Sync,
{
    fn create_service(&self) -> anyhow::Result<Box<dyn Service>> {
        (self.func)()
    }
}
