use crate::handler::{Middleware, RequestHandler};
use crate::request::{Method, Request};
use crate::response::Response;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Route table, middleware chain, and static mounts.
///
/// Routes are keyed `"METHOD:path"` with an `"ANY:path"` wildcard tried
/// second. Middleware runs before the handler and may short-circuit by
/// returning `false`, in which case the response it assembled is sent
/// as-is. Static mounts resolve after routes and only for GET.
pub struct Router {
    routes: HashMap<String, RequestHandler>,
    mounts: Vec<(String, PathBuf)>,
    middleware: Vec<Middleware>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            mounts: Vec::new(),
            middleware: Vec::new(),
        }
    }

    pub fn route<F>(&mut self, method: Method, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.routes
            .insert(format!("{}:{}", method.as_str(), path), Arc::new(handler));
    }

    /// Registers a handler for every method on `path`.
    pub fn any<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.routes.insert(format!("ANY:{path}"), Arc::new(handler));
    }

    pub fn get<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Get, path, handler);
    }

    pub fn post<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Post, path, handler);
    }

    pub fn put<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Put, path, handler);
    }

    pub fn delete<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Delete, path, handler);
    }

    /// Appends a middleware to the chain.
    pub fn wrap<F>(&mut self, middleware: F)
    where
        F: Fn(&Request, &mut Response) -> bool + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(middleware));
    }

    /// Serves files under `dir` for request paths beginning with `prefix`.
    pub fn mount_static(&mut self, prefix: &str, dir: impl Into<PathBuf>) {
        self.mounts.push((prefix.to_string(), dir.into()));
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Resolves `req` to a response: middleware chain, exact route, ANY
    /// route, static mounts, then 404.
    pub fn dispatch(&self, req: &Request) -> Response {
        let mut response = Response::new(200);
        for middleware in &self.middleware {
            if !middleware(req, &mut response) {
                debug!("middleware short-circuited {}", req.path());
                return response;
            }
        }

        let key = format!("{}:{}", req.method().as_str(), req.path());
        if let Some(handler) = self.routes.get(&key) {
            return handler(req);
        }
        if let Some(handler) = self.routes.get(&format!("ANY:{}", req.path())) {
            return handler(req);
        }

        if req.method() == Method::Get {
            if let Some(response) = self.resolve_static(req.path()) {
                return response;
            }
        }

        Response::not_found()
    }

    fn resolve_static(&self, path: &str) -> Option<Response> {
        for (prefix, dir) in &self.mounts {
            let Some(rest) = path.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let rest = rest.trim_start_matches('/');
            if rest.split('/').any(|segment| segment == "..") {
                return Some(Response::forbidden());
            }
            let file = if rest.is_empty() {
                dir.join("index.html")
            } else {
                dir.join(rest)
            };
            match std::fs::read(&file) {
                Ok(contents) => {
                    return Some(
                        Response::ok(contents)
                            .with_header("Content-Type", content_type_for(&file)),
                    );
                }
                Err(_) => continue,
            }
        }
        None
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn request(method: &str, target: &str) -> Request {
        let raw = format!("{method} {target} HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut parser = Parser::new();
        assert!(parser.parse(raw.as_bytes()).is_complete());
        parser.take_request().unwrap()
    }

    #[test]
    fn exact_route_wins() {
        let mut router = Router::new();
        router.get("/hello", |_| Response::text("hi"));

        let resp = router.dispatch(&request("GET", "/hello"));
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), b"hi");
    }

    #[test]
    fn method_mismatch_is_not_found() {
        let mut router = Router::new();
        router.get("/hello", |_| Response::text("hi"));

        assert_eq!(router.dispatch(&request("POST", "/hello")).status(), 404);
    }

    #[test]
    fn any_route_matches_every_method() {
        let mut router = Router::new();
        router.any("/every", |_| Response::text("any"));

        assert_eq!(router.dispatch(&request("GET", "/every")).status(), 200);
        assert_eq!(router.dispatch(&request("DELETE", "/every")).status(), 200);
    }

    #[test]
    fn exact_route_shadows_any_route() {
        let mut router = Router::new();
        router.any("/x", |_| Response::text("any"));
        router.get("/x", |_| Response::text("exact"));

        assert_eq!(router.dispatch(&request("GET", "/x")).body(), b"exact");
        assert_eq!(router.dispatch(&request("PUT", "/x")).body(), b"any");
    }

    #[test]
    fn middleware_short_circuit_returns_its_response() {
        let mut router = Router::new();
        router.get("/guarded", |_| Response::text("secret"));
        router.wrap(|req, resp| {
            if req.header("Authorization").is_none() {
                resp.set_status(401);
                resp.set_body("Unauthorized");
                return false;
            }
            true
        });

        let resp = router.dispatch(&request("GET", "/guarded"));
        assert_eq!(resp.status(), 401);
        assert_eq!(resp.body(), b"Unauthorized");
    }

    #[test]
    fn middleware_chain_runs_in_order() {
        let mut router = Router::new();
        router.get("/x", |_| Response::text("ok"));
        router.wrap(|_, resp| {
            resp.set_header("X-First", "1");
            true
        });
        router.wrap(|_, _| true);

        assert_eq!(router.dispatch(&request("GET", "/x")).status(), 200);
    }

    #[test]
    fn unmatched_path_is_not_found() {
        let router = Router::new();
        assert_eq!(router.dispatch(&request("GET", "/missing")).status(), 404);
    }

    #[test]
    fn static_mount_rejects_traversal() {
        let mut router = Router::new();
        router.mount_static("/files", "/tmp");

        let resp = router.dispatch(&request("GET", "/files/../etc/passwd"));
        assert_eq!(resp.status(), 403);
    }

    #[test]
    fn static_mount_serves_existing_file() {
        let dir = std::env::temp_dir().join("tarn-router-test");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("note.txt"), b"hello file").unwrap();

        let mut router = Router::new();
        router.mount_static("/assets", &dir);

        let resp = router.dispatch(&request("GET", "/assets/note.txt"));
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), b"hello file");
        assert_eq!(resp.header("Content-Type"), Some("text/plain; charset=utf-8"));
    }

    #[test]
    fn missing_static_file_is_not_found() {
        let mut router = Router::new();
        router.mount_static("/assets", "/nonexistent-dir");

        assert_eq!(router.dispatch(&request("GET", "/assets/x.png")).status(), 404);
    }
}
