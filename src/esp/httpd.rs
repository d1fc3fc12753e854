// Control routes on the ESP HTTP server, plus mDNS advertisement

use std::sync::Arc;

use anyhow::{anyhow, Result};
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer, Request};
use esp_idf_svc::http::Method;
use esp_idf_svc::mdns::EspMdns;
use log::{error, info};

use crate::control::{ControlError, ControlPlane, ROUTES};
use crate::orchestrator::{RequestServer, ServiceDiscovery};

const MAX_BODY_SIZE: usize = 2048;

#[derive(Default)]
pub struct EspRequestServer {
    server: Option<EspHttpServer<'static>>,
}

fn read_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_BODY_SIZE {
        return Err(anyhow!("request body too large ({} bytes)", len));
    }

    let mut body = vec![0u8; len];
    if len > 0 {
        req.read_exact(&mut body)
            .map_err(|e| anyhow!("failed to read request body: {:?}", e))?;
    }
    Ok(body)
}

impl RequestServer for EspRequestServer {
    fn start(
        &mut self,
        stack_size: usize,
        max_uri_handlers: usize,
        control: Arc<ControlPlane>,
    ) -> Result<()> {
        let config = Configuration {
            stack_size,
            max_uri_handlers,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&config)?;

        for (path, route) in ROUTES {
            let control = control.clone();
            server.fn_handler::<anyhow::Error, _>(path, Method::Post, move |mut req| {
                let body = read_body(&mut req)?;

                let mut pending = Some(req);
                let mut respond = |status: u16, text: &str| -> Result<(), ControlError> {
                    let req = pending
                        .take()
                        .ok_or_else(|| ControlError::Reply("response already sent".to_string()))?;
                    let mut response = req
                        .into_response(status, None, &[("Content-Type", "text/plain")])
                        .map_err(|e| ControlError::Reply(format!("{:?}", e)))?;
                    response
                        .write_all(text.as_bytes())
                        .and_then(|_| response.flush())
                        .map_err(|e| ControlError::Reply(format!("{:?}", e)))
                };

                if let Err(e) = control.serve(route, &body, &mut respond) {
                    error!("❌ {} failed: {}", path, e);
                }
                Ok(())
            })?;
        }

        info!("🌍 HTTP server listening ({} routes)", ROUTES.len());
        self.server = Some(server);
        Ok(())
    }
}

#[derive(Default)]
pub struct EspDiscovery {
    mdns: Option<EspMdns>,
}

impl ServiceDiscovery for EspDiscovery {
    fn register(&mut self, hostname: &str, instance_name: &str) -> Result<()> {
        let mut mdns = EspMdns::take()?;
        mdns.set_hostname(hostname)?;
        mdns.set_instance_name(instance_name)?;
        mdns.add_service(None, "_http", "_tcp", 80, &[])?;

        info!("📣 mDNS: {}.local ({})", hostname, instance_name);
        self.mdns = Some(mdns);
        Ok(())
    }
}
