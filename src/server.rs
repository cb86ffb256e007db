//! HTTP intake for webhook deliveries. Handlers never block on a full
//! queue: they shed load with 503 and let the host redeliver.

use crate::{
    event_loop::WebhookEvent,
    Error, Result,
};
use futures::future;
use hyper::{
    body,
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server as HyperServer, StatusCode,
};
use log::{debug, info, warn};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;

/// The GitHub header key used to pass the event type
///
/// GitHub API docs: https://developer.github.com/webhooks/#delivery-headers
pub const EVENT_TYPE_HEADER: &str = "X-GitHub-Event";

/// The GitHub header key used to pass the unique ID for the webhook event
pub const DELIVERY_ID_HEADER: &str = "X-GitHub-Delivery";

/// The GitHub header key used to pass the HMAC hexdigest
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";

#[derive(Clone)]
pub struct Server {
    counter: Arc<AtomicUsize>,
    secret: Arc<Option<String>>,
    /// One webhook queue per hosted project; deliveries fan out to all
    /// of them and the adapters filter by repository
    queues: Arc<Vec<mpsc::Sender<WebhookEvent>>>,
}

impl Server {
    pub fn new(secret: Option<String>, queues: Vec<mpsc::Sender<WebhookEvent>>) -> Self {
        Self {
            counter: Arc::new(AtomicUsize::new(0)),
            secret: Arc::new(secret),
            queues: Arc::new(queues),
        }
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        // The closure inside `make_service_fn` is run for each
        // connection, creating a 'service' to handle requests for that
        // specific connection.
        let make_service = make_service_fn(move |socket: &AddrStream| {
            debug!("remote address: {:?}", socket.remote_addr());

            let server = self.clone();
            future::ok::<_, Error>(service_fn(move |request| {
                let server = server.clone();
                server.handle_request(request)
            }))
        });

        info!("Listening on http://{}", addr);
        HyperServer::bind(&addr).serve(make_service).await?;

        Ok(())
    }

    async fn handle_request(self, request: Request<Body>) -> Result<Response<Body>> {
        let count = self.counter.fetch_add(1, Ordering::AcqRel) + 1;

        match (request.method(), request.uri().path()) {
            (&Method::GET, "/") => Ok(Response::new(Body::from(format!(
                "hoff is listening, request #{}\n",
                count
            )))),
            (&Method::POST, "/hook/github") => self.handle_webhook(request).await,
            (&Method::GET, "/hook/github") => {
                text_response(StatusCode::BAD_REQUEST, "expecting POST request at /hook/github")
            }
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn handle_webhook(&self, request: Request<Body>) -> Result<Response<Body>> {
        let event_type = match request
            .headers()
            .get(EVENT_TYPE_HEADER)
            .and_then(|h| h.to_str().ok())
        {
            Some(event_type) => event_type.to_owned(),
            None => {
                return text_response(StatusCode::BAD_REQUEST, "missing X-GitHub-Event header")
            }
        };

        let delivery_id = request
            .headers()
            .get(DELIVERY_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let signature = request
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned);

        let body = body::to_bytes(request.into_body()).await?.to_vec();

        if !check_signature(
            self.secret.as_deref().map(str::as_bytes),
            signature.as_deref(),
            &body,
        ) {
            warn!("signature check failed for delivery {}", delivery_id);
            return text_response(StatusCode::BAD_REQUEST, "signature mismatch");
        }

        match event_type.as_str() {
            "ping" => text_response(StatusCode::OK, "pong"),
            "pull_request" | "issue_comment" | "status" => {
                debug!("delivery {} ({})", delivery_id, event_type);
                let event = WebhookEvent {
                    event_type,
                    delivery_id,
                    body,
                };

                let mut dropped = false;
                for queue in self.queues.iter() {
                    // Non-blocking by design: a full queue means the
                    // pipeline is backed up, and the host should retry
                    // later. A closed queue means we are shutting down;
                    // shed load the same way.
                    if queue.try_send(event.clone()).is_err() {
                        dropped = true;
                    }
                }

                if dropped {
                    text_response(StatusCode::SERVICE_UNAVAILABLE, "webhook queue full")
                } else {
                    text_response(StatusCode::OK, "OK")
                }
            }
            _ => text_response(StatusCode::OK, "hook ignored"),
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Result<Response<Body>> {
    Ok(Response::builder().status(status).body(Body::from(body))?)
}

fn check_signature(secret: Option<&[u8]>, signature: Option<&str>, body: &[u8]) -> bool {
    match (secret, signature) {
        (Some(key), Some(signature)) if signature.starts_with("sha1=") => {
            let hash = hex::encode(hmacsha1::hmac_sha1(key, body));
            hash == signature["sha1=".len()..]
        }
        // We are expecting a signature and we either received it in a
        // different format than expected or no signature was sent.
        (Some(_), _) => false,
        // No key to check against
        (None, _) => {
            warn!("no secret configured; signature ignored");
            true
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event_loop::QUEUE_CAPACITY;

    fn server_with_queue(
        secret: Option<&str>,
        capacity: usize,
    ) -> (Server, mpsc::Receiver<WebhookEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Server::new(secret.map(str::to_owned), vec![tx]), rx)
    }

    fn hook_request(event_type: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::builder().method(Method::POST).uri("/hook/github");
        if let Some(event_type) = event_type {
            builder = builder.header(EVENT_TYPE_HEADER, event_type);
        }
        builder
            .header(DELIVERY_ID_HEADER, "d-1")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn get_root_answers() {
        let (server, _rx) = server_with_queue(None, QUEUE_CAPACITY);
        let request = Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_on_the_hook_path_is_a_bad_request() {
        let (server, _rx) = server_with_queue(None, QUEUE_CAPACITY);
        let request = Request::builder()
            .method(Method::GET)
            .uri("/hook/github")
            .body(Body::empty())
            .unwrap();

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let (server, _rx) = server_with_queue(None, QUEUE_CAPACITY);
        let request = Request::builder()
            .method(Method::GET)
            .uri("/nope")
            .body(Body::empty())
            .unwrap();

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn the_event_header_is_required() {
        let (server, _rx) = server_with_queue(None, QUEUE_CAPACITY);

        let response = server.handle_request(hook_request(None, "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pings_are_acknowledged_without_enqueueing() {
        let (server, mut rx) = server_with_queue(None, QUEUE_CAPACITY);

        let response = server
            .handle_request(hook_request(Some("ping"), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn recognized_events_are_enqueued() {
        let (server, mut rx) = server_with_queue(None, QUEUE_CAPACITY);

        let response = server
            .handle_request(hook_request(Some("pull_request"), r#"{"number": 7}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, "pull_request");
        assert_eq!(event.delivery_id, "d-1");
        assert_eq!(event.body, br#"{"number": 7}"#.to_vec());
    }

    #[tokio::test]
    async fn other_event_types_are_ignored_but_acknowledged() {
        let (server, mut rx) = server_with_queue(None, QUEUE_CAPACITY);

        let response = server
            .handle_request(hook_request(Some("gollum"), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hook ignored");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn a_full_queue_sheds_load_with_503() {
        let (server, mut rx) = server_with_queue(None, 1);

        let first = server
            .clone()
            .handle_request(hook_request(Some("pull_request"), "{}"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = server
            .clone()
            .handle_request(hook_request(Some("pull_request"), "{}"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Once the adapter catches up there is room again
        rx.recv().await.unwrap();
        let third = server
            .handle_request(hook_request(Some("pull_request"), "{}"))
            .await
            .unwrap();
        assert_eq!(third.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_signatures_are_accepted() {
        let (server, mut rx) = server_with_queue(Some("hunter2"), QUEUE_CAPACITY);

        let signature = format!("sha1={}", hex::encode(hmacsha1::hmac_sha1(b"hunter2", b"{}")));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/hook/github")
            .header(EVENT_TYPE_HEADER, "pull_request")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from("{}"))
            .unwrap();

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn bad_or_missing_signatures_are_rejected() {
        let (server, mut rx) = server_with_queue(Some("hunter2"), QUEUE_CAPACITY);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/hook/github")
            .header(EVENT_TYPE_HEADER, "pull_request")
            .header(SIGNATURE_HEADER, "sha1=deadbeef")
            .body(Body::from("{}"))
            .unwrap();
        let response = server.clone().handle_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = server
            .handle_request(hook_request(Some("pull_request"), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(rx.try_recv().is_err());
    }
}
