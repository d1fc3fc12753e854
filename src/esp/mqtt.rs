// ESP-MQTT client behind the messaging traits

use std::ffi::CString;
use std::sync::Arc;

use esp_idf_svc::handle::RawHandle;
use esp_idf_svc::mqtt::client::{
    EspMqttClient, EventPayload, LwtConfiguration, MqttClientConfiguration,
};
use esp_idf_svc::sys::{esp_mqtt_client_publish, esp_mqtt_client_subscribe_single, ESP_ERR_NO_MEM};
use log::debug;

use crate::mqtt_client::{
    BrokerConfig, EventSink, MqttConnector, MqttError, MqttErrorKind, MqttEvent, MqttTransport,
    QoS,
};

pub struct EspMqttConnector;

impl MqttConnector for EspMqttConnector {
    fn connect(
        &self,
        config: &BrokerConfig,
        events: EventSink,
    ) -> Result<Arc<dyn MqttTransport>, MqttError> {
        let (username, password) = match &config.credentials {
            Some((username, password)) => (Some(username.as_str()), Some(password.as_str())),
            None => (None, None),
        };

        let lwt = config.last_will.as_ref().map(|will| LwtConfiguration {
            topic: &will.topic,
            payload: &will.payload,
            qos: will.qos,
            retain: will.retain,
        });

        let conf = MqttClientConfiguration {
            client_id: Some(&config.client_id),
            username,
            password,
            keep_alive_interval: Some(config.keep_alive),
            lwt,
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };

        let client = EspMqttClient::new_cb(&config.uri, &conf, move |event| {
            let event = match event.payload() {
                EventPayload::Connected(_) => MqttEvent::Connected,
                EventPayload::Disconnected => MqttEvent::Disconnected,
                EventPayload::Published(_) => MqttEvent::Published,
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    ..
                } => MqttEvent::Received {
                    topic: topic.to_string(),
                    payload: data.to_vec(),
                },
                // esp-mqtt reports failed connects and dropped sockets here, then reconnects itself
                EventPayload::Error(e) if e.code() == ESP_ERR_NO_MEM as i32 => {
                    MqttEvent::Error(MqttErrorKind::Transport(e.to_string()))
                }
                EventPayload::Error(e) => MqttEvent::Error(MqttErrorKind::Connection(e.to_string())),
                other => {
                    debug!("Ignoring MQTT event {:?}", other);
                    return;
                }
            };
            events(event);
        })
        .map_err(|e| MqttError::Client(e.to_string()))?;

        Ok(Arc::new(EspMqttTransport { client }))
    }
}

/// Owns the native client; wire calls go straight to the thread-safe C API so
/// they can be made from inside the event callback and from application tasks.
struct EspMqttTransport {
    client: EspMqttClient<'static>,
}

// esp-mqtt serializes every API call on the client's own recursive lock
unsafe impl Sync for EspMqttTransport {}

fn c_topic(topic: &str) -> Result<CString, MqttError> {
    CString::new(topic).map_err(|_| MqttError::Client(format!("invalid topic '{}'", topic)))
}

fn message_id(id: i32, what: &str, topic: &str) -> Result<(), MqttError> {
    if id < 0 {
        Err(MqttError::Client(format!("{} to '{}' was rejected", what, topic)))
    } else {
        debug!("{} to {} queued as message {}", what, topic, id);
        Ok(())
    }
}

impl MqttTransport for EspMqttTransport {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let c_topic = c_topic(topic)?;
        let id = unsafe {
            esp_mqtt_client_subscribe_single(self.client.handle(), c_topic.as_ptr(), qos as i32)
        };
        message_id(id, "Subscribe", topic)
    }

    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) -> Result<(), MqttError> {
        let c_topic = c_topic(topic)?;
        let len = i32::try_from(payload.len())
            .map_err(|_| MqttError::Client(format!("payload too large ({} bytes)", payload.len())))?;
        let id = unsafe {
            esp_mqtt_client_publish(
                self.client.handle(),
                c_topic.as_ptr(),
                payload.as_ptr().cast(),
                len,
                qos as i32,
                retain as i32,
            )
        };
        message_id(id, "Publish", topic)
    }
}
