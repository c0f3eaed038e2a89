//! Depends strongly on `greeter`; relays an `echo` event into a local
//! service call and republishes the result — exercises the call router and
//! the event bus together, and the linear-dependency init order.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use extcore::context::ExtensionCtx;
use extcore::contracts::{Dependencies, Extension, HandlerFn, Metadata};
use extcore::events::{EventEnvelope, EventTarget};
use extcore::extension;
use extcore::manager::Manager;
use extcore::router::CallOptions;
use parking_lot::RwLock;
use serde_json::{json, Value};

#[extension(name = "echo_relay")]
#[derive(Default)]
pub struct EchoRelay {
    manager: RwLock<Option<Weak<Manager>>>,
}

#[async_trait]
impl Extension for EchoRelay {
    fn name(&self) -> &'static str {
        "echo_relay"
    }

    fn version(&self) -> &'static str {
        "0.1.0"
    }

    fn dependencies(&self) -> Dependencies {
        Dependencies::new(vec!["greeter"], vec![])
    }

    fn metadata(&self) -> Metadata {
        Metadata {
            description: "relays echo events through the greeter service",
            group: "demo",
            kind: "extension",
        }
    }

    async fn init(&self, ctx: &ExtensionCtx) -> anyhow::Result<()> {
        let weak = ctx.manager().map(|m| Arc::downgrade(&m));
        *self.manager.write() = weak;
        tracing::info!("echo_relay initialized");
        Ok(())
    }

    fn handlers(&self) -> HashMap<&'static str, HandlerFn> {
        let manager = self.manager.read().clone();
        let mut table: HashMap<&'static str, HandlerFn> = HashMap::new();
        table.insert(
            "echo",
            Box::new(move |env: EventEnvelope| {
                let Some(manager) = manager.as_ref().and_then(Weak::upgrade) else {
                    return;
                };
                let name = env
                    .payload
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("world")
                    .to_string();
                tokio::spawn(async move {
                    let result = manager
                        .call_service("greeter", "Greet", json!({ "name": name }), CallOptions::default())
                        .await;
                    match result {
                        Ok(response) => {
                            if let Err(e) = manager
                                .publish_event("echo.relayed", response, EventTarget::Auto)
                                .await
                            {
                                tracing::warn!(error = %e, "echo_relay republish failed");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "echo_relay call failed"),
                    }
                });
            }),
        );
        table
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
