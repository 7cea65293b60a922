use crate::conn::Connection;
use crate::request::Request;
use crate::response::Response;
use std::sync::Arc;

/// Capability set a [`Connection`] delegates event processing to.
///
/// Every method has a default: the lifecycle hooks are no-ops and the
/// event sinks fall through to the connection's built-in read/write/error
/// handling, so an implementor only overrides what it cares about.
pub trait Handler: Send + Sync {
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    fn on_disconnect(&self, _conn: &Arc<Connection>) {}

    fn on_readable(&self, conn: &Arc<Connection>) {
        conn.default_handle_read();
    }

    fn on_writable(&self, conn: &Arc<Connection>) {
        conn.default_handle_write();
    }

    fn on_error(&self, conn: &Arc<Connection>) {
        conn.default_handle_error();
    }
}

/// Application handler: turns a request into a response. Runs on a worker
/// thread, so blocking is allowed.
pub type RequestHandler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// Chain link that may inspect or mutate the request/response pair.
/// Returning `false` short-circuits the chain and the current response is
/// sent as-is.
pub type Middleware = Arc<dyn Fn(&Request, &mut Response) -> bool + Send + Sync>;
