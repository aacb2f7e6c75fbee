//! Redundant ways of issuing the same physical action.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::actuation::types::ChannelError;
use crate::config::{MqttSettings, TransportSettings};
use crate::device::{Credentials, DeviceAddress};

/// REST endpoint that opens the first door
pub const DOOR_OPEN_PATH: &str = "/api/v1/doors/1/open";

/// Relay board topic wired to the door button
pub const RELAY_TOPIC: &str = "ESP/Relay6CH/Door_2";
pub const RELAY_PAYLOAD: &str = "1";

/// Servo that presents a key to the reader
pub const KEY_TOPIC: &str = "ESP/Relay6CH/Servo";
pub const KEY_PAYLOAD: &str = "speed:15 Angle:75";

/// A mechanism for issuing the action to a device
#[async_trait]
pub trait ActuationChannel: Send + Sync {
    /// Short identifier used in reports (`api`, `relay`, `key`)
    fn name(&self) -> &str;

    /// Issue the command once. `Ok` means the command left successfully, not
    /// that the device acted on it.
    async fn issue(
        &self,
        device: &DeviceAddress,
        credentials: &Credentials,
    ) -> Result<(), ChannelError>;
}

/// Shared, ordered channel list
pub type ChannelSet = Vec<Arc<dyn ActuationChannel>>;

/// The three standard channels in their fixed order: REST, relay, key
pub fn default_channels(transport: &TransportSettings) -> ChannelSet {
    vec![
        Arc::new(RestDoorChannel::new(transport.http_timeout)),
        Arc::new(MqttTriggerChannel::new(
            "relay",
            transport.mqtt.clone(),
            RELAY_TOPIC,
            RELAY_PAYLOAD,
            transport.http_timeout,
        )),
        Arc::new(MqttTriggerChannel::new(
            "key",
            transport.mqtt.clone(),
            KEY_TOPIC,
            KEY_PAYLOAD,
            transport.http_timeout,
        )),
    ]
}

/// `POST` to the device's door endpoint; the device answers `204`.
#[derive(Debug, Clone)]
pub struct RestDoorChannel {
    client: reqwest::Client,
    path: String,
}

impl RestDoorChannel {
    pub fn new(timeout: Duration) -> Self {
        Self::with_path(timeout, DOOR_OPEN_PATH)
    }

    pub fn with_path(timeout: Duration, path: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            path: path.into(),
        }
    }
}

#[async_trait]
impl ActuationChannel for RestDoorChannel {
    fn name(&self) -> &str {
        "api"
    }

    async fn issue(
        &self,
        device: &DeviceAddress,
        credentials: &Credentials,
    ) -> Result<(), ChannelError> {
        let url = format!("{}{}", device.base_url(), self.path);
        let response = self
            .client
            .post(&url)
            .basic_auth(&credentials.login, Some(&credentials.secret))
            .send()
            .await?;
        match response.status().as_u16() {
            204 => Ok(()),
            other => Err(ChannelError::UnexpectedStatus(other)),
        }
    }
}

/// Publish a fixed payload to a broker topic that drives lab hardware.
#[derive(Debug, Clone)]
pub struct MqttTriggerChannel {
    name: String,
    broker: MqttSettings,
    topic: String,
    payload: String,
    timeout: Duration,
}

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

impl MqttTriggerChannel {
    pub fn new(
        name: impl Into<String>,
        broker: MqttSettings,
        topic: impl Into<String>,
        payload: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            broker,
            topic: topic.into(),
            payload: payload.into(),
            timeout,
        }
    }

    fn client_id(&self) -> String {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "harness".to_string());
        format!(
            "intercom-harness-{}-{}-{}",
            host,
            std::process::id(),
            CLIENT_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }
}

#[async_trait]
impl ActuationChannel for MqttTriggerChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn issue(
        &self,
        _device: &DeviceAddress,
        _credentials: &Credentials,
    ) -> Result<(), ChannelError> {
        let mut options = MqttOptions::new(self.client_id(), &self.broker.host, self.broker.port);
        options.set_keep_alive(Duration::from_secs(5));
        if let Some(user) = &self.broker.user {
            options.set_credentials(user, self.broker.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        client
            .publish(&self.topic, QoS::AtLeastOnce, false, self.payload.clone().into_bytes())
            .await
            .map_err(|e| ChannelError::Mqtt(e.to_string()))?;

        let acked = tokio::time::timeout(self.timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(ChannelError::Mqtt(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| ChannelError::Timeout(self.timeout))?;

        if acked.is_ok() {
            disconnect(&client, &mut eventloop).await;
        }
        debug!(topic = %self.topic, channel = %self.name, "trigger published");
        acked
    }
}

/// Upper bound on flushing DISCONNECT after a publish
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Queue DISCONNECT and drive the event loop until it is written.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "mqtt disconnect not queued");
        return;
    }
    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    })
    .await;
    match flushed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "mqtt disconnect failed"),
        Err(_) => debug!("mqtt disconnect not flushed in time"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn device(server: &MockServer) -> DeviceAddress {
        DeviceAddress::new(server.host(), Some(server.port()))
    }

    #[tokio::test]
    async fn test_rest_channel_accepts_204() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(DOOR_OPEN_PATH)
                    .header_exists("authorization");
                then.status(204);
            })
            .await;

        let channel = RestDoorChannel::new(Duration::from_secs(2));
        channel
            .issue(&device(&server), &Credentials::new("admin", "x"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rest_channel_rejects_other_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(DOOR_OPEN_PATH);
                then.status(401);
            })
            .await;

        let channel = RestDoorChannel::new(Duration::from_secs(2));
        let err = channel
            .issue(&device(&server), &Credentials::new("admin", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnexpectedStatus(401)));
    }

    #[tokio::test]
    async fn test_mqtt_channel_reports_unreachable_broker() {
        let broker = MqttSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: None,
            password: None,
        };
        let channel =
            MqttTriggerChannel::new("relay", broker, RELAY_TOPIC, RELAY_PAYLOAD, Duration::from_secs(2));
        let result = channel
            .issue(&DeviceAddress::new("10.0.0.5", None), &Credentials::default())
            .await;
        assert!(result.is_err());
    }

    /// Read one MQTT packet: fixed header byte and body.
    async fn read_packet(stream: &mut tokio::net::TcpStream) -> (u8, Vec<u8>) {
        use tokio::io::AsyncReadExt;
        let header = stream.read_u8().await.unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    #[tokio::test]
    async fn test_mqtt_channel_publishes_and_disconnects() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (connect, _) = read_packet(&mut stream).await;
            assert_eq!(connect >> 4, 1);
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let (publish, body) = read_packet(&mut stream).await;
            assert_eq!(publish >> 4, 3);
            let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
            let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
            let pkid = [body[2 + topic_len], body[3 + topic_len]];
            let payload = String::from_utf8(body[4 + topic_len..].to_vec()).unwrap();
            stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await.unwrap();

            let (last, _) = read_packet(&mut stream).await;
            (topic, payload, last)
        });

        let broker = MqttSettings {
            host: "127.0.0.1".to_string(),
            port,
            user: None,
            password: None,
        };
        let channel =
            MqttTriggerChannel::new("relay", broker, RELAY_TOPIC, RELAY_PAYLOAD, Duration::from_secs(2));
        channel
            .issue(&DeviceAddress::new("10.0.0.5", None), &Credentials::default())
            .await
            .unwrap();

        let (topic, payload, last) = tokio::time::timeout(Duration::from_secs(2), broker_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, RELAY_TOPIC);
        assert_eq!(payload, RELAY_PAYLOAD);
        assert_eq!(last, 0xE0);
    }

    #[test]
    fn test_default_channel_order() {
        let channels = default_channels(&crate::config::TransportSettings::defaults());
        let names: Vec<&str> = channels.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["api", "relay", "key"]);
    }
}
