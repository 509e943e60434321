/// `hello` based health checker
use super::{HealthChecker, HealthStatus};
use crate::core::codec::Codec;
use crate::core::connection::{Channel, Transport};
use crate::core::{Endpoint, ServerRole};
use crate::topology::ServerDescription;
use crate::utils::is_truthy;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Sends `hello` over a dedicated monitoring channel per endpoint.
///
/// The channel is kept between heartbeats and dropped after any failure, so
/// the next heartbeat reconnects.
pub struct HelloChecker {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    check_timeout: Duration,
    app_name: Option<String>,
    channels: Mutex<HashMap<Endpoint, Box<dyn Channel>>>,
}

impl HelloChecker {
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<dyn Codec>, check_timeout: Duration) -> Self {
        Self {
            transport,
            codec,
            check_timeout,
            app_name: None,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Application name announced in the first `hello` on each channel
    pub fn with_app_name(mut self, app_name: Option<String>) -> Self {
        self.app_name = app_name;
        self
    }

    async fn hello(&self, endpoint: &Endpoint) -> Result<Document, String> {
        let cached = self.channels.lock().await.remove(endpoint);
        let (mut channel, fresh) = match cached {
            Some(channel) => (channel, false),
            None => {
                let channel = self
                    .transport
                    .connect(endpoint, self.check_timeout)
                    .await
                    .map_err(|e| format!("connect failed: {e}"))?;
                (channel, true)
            }
        };

        let mut command = doc! { "hello": 1, "$db": "admin" };
        if fresh {
            if let Some(name) = &self.app_name {
                command.insert("client", doc! { "application": { "name": name.as_str() } });
            }
        }

        let request = self.codec.encode(&command).map_err(|e| e.to_string())?;
        channel
            .send(&request)
            .await
            .map_err(|e| format!("send failed: {e}"))?;
        let reply = channel
            .receive(self.check_timeout)
            .await
            .map_err(|e| format!("receive failed: {e}"))?;
        let document = self.codec.decode(&reply).map_err(|e| e.to_string())?;

        self.channels.lock().await.insert(endpoint.clone(), channel);
        Ok(document)
    }
}

#[async_trait]
impl HealthChecker for HelloChecker {
    async fn check_health(&self, endpoint: &Endpoint) -> HealthStatus {
        debug!("Sending hello to {}", endpoint);
        match self.hello(endpoint).await.and_then(|reply| parse_hello(&reply)) {
            Ok(description) => HealthStatus::Healthy(description),
            Err(reason) => HealthStatus::Unhealthy { reason },
        }
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }

    async fn forget(&self, endpoint: &Endpoint) {
        if let Some(mut channel) = self.channels.lock().await.remove(endpoint) {
            let _ = channel.close().await;
        }
    }
}

/// Interpret a `hello` (or legacy `isMaster`) reply
pub fn parse_hello(reply: &Document) -> Result<ServerDescription, String> {
    if !is_truthy(reply.get("ok")) {
        let message = reply.get_str("errmsg").unwrap_or("hello failed");
        return Err(message.to_string());
    }

    let role = if is_truthy(reply.get("isWritablePrimary")) || is_truthy(reply.get("ismaster")) {
        Some(ServerRole::Primary)
    } else if is_truthy(reply.get("secondary")) {
        Some(ServerRole::Secondary)
    } else {
        None
    };

    let tags: BTreeMap<String, String> = reply
        .get_document("tags")
        .map(|tags| {
            tags.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let mut hosts = Vec::new();
    for field in ["hosts", "passives"] {
        if let Ok(members) = reply.get_array(field) {
            for member in members.iter().filter_map(Bson::as_str) {
                match member.parse::<Endpoint>() {
                    Ok(endpoint) => hosts.push(endpoint),
                    Err(e) => debug!("Ignoring advertised member {}: {}", member, e),
                }
            }
        }
    }

    let last_write_date = reply
        .get_document("lastWrite")
        .ok()
        .and_then(|last_write| last_write.get_datetime("lastWriteDate").ok())
        .map(|date| date.to_system_time());

    Ok(ServerDescription {
        role,
        tags,
        hosts,
        last_write_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::BsonCodec;
    use crate::core::mock::{MockServer, MockTransport};
    use bson::DateTime;
    use std::io;

    fn h(name: &str) -> Endpoint {
        Endpoint::new(name, 27017)
    }

    #[test]
    fn test_parse_primary_reply() {
        let reply = doc! {
            "isWritablePrimary": true,
            "hosts": ["h1:27017", "h2:27017", "bad:port"],
            "passives": ["h3:27017"],
            "tags": { "dc": "ny", "weight": 3 },
            "lastWrite": { "lastWriteDate": DateTime::from_millis(1_700_000_000_000) },
            "ok": 1.0,
        };
        let description = parse_hello(&reply).unwrap();
        assert_eq!(description.role, Some(ServerRole::Primary));
        assert_eq!(description.hosts, vec![h("h1"), h("h2"), h("h3")]);
        assert_eq!(description.tags.get("dc").map(String::as_str), Some("ny"));
        assert!(!description.tags.contains_key("weight"));
        assert!(description.last_write_date.is_some());
    }

    #[test]
    fn test_parse_legacy_and_secondary_replies() {
        let legacy = doc! { "ismaster": true, "ok": 1 };
        assert_eq!(parse_hello(&legacy).unwrap().role, Some(ServerRole::Primary));

        let secondary = doc! { "isWritablePrimary": false, "secondary": true, "ok": 1 };
        assert_eq!(parse_hello(&secondary).unwrap().role, Some(ServerRole::Secondary));

        let arbiter = doc! { "isWritablePrimary": false, "secondary": false, "arbiterOnly": true, "ok": 1 };
        assert_eq!(parse_hello(&arbiter).unwrap().role, None);

        let failed = doc! { "ok": 0, "errmsg": "not ready" };
        assert_eq!(parse_hello(&failed).unwrap_err(), "not ready");
    }

    #[tokio::test]
    async fn test_hello_checker_reuses_channel() {
        let server = MockServer::new(|_endpoint, command| {
            assert!(command.contains_key("hello"));
            Ok(doc! { "isWritablePrimary": true, "ok": 1 })
        });
        let transport = Arc::new(MockTransport::new(server.clone()));
        let checker = HelloChecker::new(transport, Arc::new(BsonCodec), Duration::from_secs(1))
            .with_app_name(Some("tests".to_string()));

        assert!(checker.check_health(&h("h1")).await.is_healthy());
        assert!(checker.check_health(&h("h1")).await.is_healthy());
        assert_eq!(server.connects(), 1);

        let calls = server.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].1.contains_key("client"));
        assert!(!calls[1].1.contains_key("client"));
        assert_eq!(calls[0].1.get_str("$db").unwrap(), "admin");

        checker.forget(&h("h1")).await;
        assert!(checker.check_health(&h("h1")).await.is_healthy());
        assert_eq!(server.connects(), 2);
    }

    #[tokio::test]
    async fn test_hello_checker_reports_failures() {
        let server = MockServer::new(|_endpoint, _command| {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        });
        server.refuse(&h("h2"));
        let transport = Arc::new(MockTransport::new(server.clone()));
        let checker = HelloChecker::new(transport, Arc::new(BsonCodec), Duration::from_secs(1));

        match checker.check_health(&h("h1")).await {
            HealthStatus::Unhealthy { reason } => assert!(reason.contains("receive failed")),
            other => panic!("expected unhealthy, got {other}"),
        }
        match checker.check_health(&h("h2")).await {
            HealthStatus::Unhealthy { reason } => assert!(reason.contains("connect failed")),
            other => panic!("expected unhealthy, got {other}"),
        }
    }
}
