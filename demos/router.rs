//! A small routing layer on top of ferrule.
//! Demonstrates path parameters, shared state and gzip/chunked responses.

use ferrule::{HandlerError, Request, Response, Server, ServerConfig, Service};
use matchit::Router;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A route handler. Path parameters are passed alongside the request.
type Handler =
    Box<dyn Fn(&Request, &HashMap<String, String>, &mut Response) -> Result<(), HandlerError> + Send + Sync>;

/// Dispatches requests through a `matchit` routing table.
struct RouterService {
    router: Router<Handler>,
}

impl RouterService {
    /// Routes:
    /// - GET "/" - welcome message
    /// - GET "/hello/:name" - personalized greeting
    /// - GET "/counter" - increments a shared counter
    /// - GET "/stream" - a chunked response
    fn new() -> Result<Self, matchit::InsertError> {
        let mut router = Router::new();
        let counter = Arc::new(Mutex::new(0u64));

        router.insert(
            "/",
            Box::new(|_: &Request, _: &HashMap<String, String>, res: &mut Response| {
                res.set_header("Content-Type", "text/plain")
                    .set_body("Welcome to ferrule!");
                Ok(())
            }) as Handler,
        )?;

        router.insert(
            "/hello/:name",
            Box::new(|_: &Request, params: &HashMap<String, String>, res: &mut Response| {
                let name = params.get("name").map(String::as_str).unwrap_or("world");
                res.set_body(format!("Hello, {}!", name));
                Ok(())
            }) as Handler,
        )?;

        router.insert(
            "/counter",
            Box::new(move |_: &Request, _: &HashMap<String, String>, res: &mut Response| {
                let mut count = counter.lock().map_err(|_| "counter lock poisoned")?;
                *count += 1;
                res.set_body(format!("Counter: {}", count));
                Ok(())
            }) as Handler,
        )?;

        router.insert(
            "/stream",
            Box::new(|_: &Request, _: &HashMap<String, String>, res: &mut Response| {
                let lines: String = (1..=100).map(|i| format!("line {}\n", i)).collect();
                res.set_chunked(true).set_body(lines);
                Ok(())
            }) as Handler,
        )?;

        Ok(Self { router })
    }
}

impl Service for RouterService {
    fn call(&self, request: &Request, response: &mut Response) -> Result<(), HandlerError> {
        match self.router.at(request.path()) {
            Ok(matched) => {
                let params = matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                (matched.value)(request, &params, response)
            }
            Err(_) => {
                response.set_status(404).set_body("Not Found");
                Ok(())
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 3000,
        ..ServerConfig::new()?
    };

    println!("Server running at http://127.0.0.1:3000");
    println!("Try these routes:");
    println!("  - /");
    println!("  - /hello/your-name");
    println!("  - /counter (increments on each visit)");
    println!("  - /stream (chunked)");

    Server::new(config).serve(RouterService::new()?)?;
    Ok(())
}
