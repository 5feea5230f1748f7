use crate::error::HandlerError;

/// Request handler run by a [`Server`](crate::Server)
///
/// Called once per request with the command name and payload. Runs on the
/// blocking thread pool, so it may block or sleep. Errors and panics are
/// reported back to the caller and do not stop the server.
pub trait Handler<P, R>: Send + Sync + 'static {
    fn handle(&self, command: String, payload: P) -> Result<R, HandlerError>;
}

impl<F, P, R> Handler<P, R> for F
where
    F: Fn(String, P) -> Result<R, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, command: String, payload: P) -> Result<R, HandlerError> {
        self(command, payload)
    }
}
