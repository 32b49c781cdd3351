use anyhow::{anyhow, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::error;

const PROMETHEUS_PREFIX: &str = "chat_node";

pub struct NodeMetrics {
    pub registry: Registry,
    pub messages_sent: IntCounter,
    pub messages_received: IntCounter,
    pub send_failures: IntCounter,
    pub dht_lookups: IntCounter,
    pub peers_gauge: IntGauge,
}

impl NodeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(PROMETHEUS_PREFIX.into()), None)?;

        let messages_sent = IntCounter::with_opts(Opts::new(
            "messages_sent",
            "Chat requests written to peers",
        ))?;
        let messages_received = IntCounter::with_opts(Opts::new(
            "messages_received",
            "Chat requests received from peers",
        ))?;
        let send_failures = IntCounter::with_opts(Opts::new(
            "send_failures",
            "Chat requests that failed or timed out",
        ))?;
        let dht_lookups = IntCounter::with_opts(Opts::new(
            "dht_lookups",
            "Closest-peer queries issued to the DHT",
        ))?;
        let peers_gauge = IntGauge::with_opts(Opts::new("peers", "Current connected peers"))?;

        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(send_failures.clone()))?;
        registry.register(Box::new(dht_lookups.clone()))?;
        registry.register(Box::new(peers_gauge.clone()))?;

        Ok(Self {
            registry,
            messages_sent,
            messages_received,
            send_failures,
            dht_lookups,
            peers_gauge,
        })
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| anyhow!("encode metrics: {e}"))?;
        Ok(buffer)
    }

    pub fn spawn_server(self: Arc<Self>, addr: SocketAddr) -> Result<JoinHandle<()>> {
        let server = hyper::Server::try_bind(&addr).map_err(|e| anyhow!("metrics bind: {e}"))?;

        let service = hyper::service::make_service_fn(move |_| {
            let metrics = self.clone();
            async move {
                Ok::<_, hyper::Error>(hyper::service::service_fn(move |_req| {
                    let metrics = metrics.clone();
                    async move {
                        let buffer = match metrics.render() {
                            Ok(buffer) => buffer,
                            Err(e) => {
                                error!(?e, "encode metrics");
                                let mut response =
                                    Response::new(Body::from("failed to encode metrics"));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                return Ok::<_, hyper::Error>(response);
                            }
                        };

                        let mut response = Response::new(Body::from(buffer));
                        match HeaderValue::from_str(TextEncoder::new().format_type()) {
                            Ok(content_type) => {
                                response.headers_mut().insert(CONTENT_TYPE, content_type);
                            }
                            Err(e) => {
                                error!(?e, "invalid content-type header");
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                *response.body_mut() = Body::from("invalid content type");
                            }
                        }
                        Ok::<_, hyper::Error>(response)
                    }
                }))
            }
        });

        let handle = tokio::spawn(async move {
            if let Err(e) = server.serve(service).await {
                error!(?e, "metrics server error");
            }
        });
        Ok(handle)
    }
}
