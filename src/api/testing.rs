//! In-memory transport for unit tests: canned responses keyed by path.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::api::transport::{ApiRequest, ApiResponse, Transport};
use crate::error::TransportError;

type Handler = Arc<dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedTransport {
    routes: Vec<(String, Handler)>,
    sent: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, path: &str, status: u16, body: &str) -> Self {
        let body = body.to_string();
        self.respond_with(path, move |_| {
            Ok(ApiResponse {
                status,
                body: body.clone(),
            })
        })
    }

    pub fn respond_with<F>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    {
        self.routes.push((path.to_string(), Arc::new(handler)));
        self
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.sent.lock().unwrap().push(request.clone());
        match self.routes.iter().find(|(path, _)| *path == request.path) {
            Some((_, handler)) => handler(&request),
            None => Ok(ApiResponse {
                status: 404,
                body: String::new(),
            }),
        }
    }
}
