//! Minimal extension with no dependencies — exercises the base lifecycle
//! and exposes one local service method.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use extcore::context::ExtensionCtx;
use extcore::contracts::{Dependencies, Extension, Metadata, ServiceMethod};
use extcore::extension;
use parking_lot::RwLock;
use serde_json::{json, Value};

#[extension(name = "greeter")]
#[derive(Default)]
pub struct Greeter {
    template: RwLock<String>,
}

#[async_trait]
impl Extension for Greeter {
    fn name(&self) -> &'static str {
        "greeter"
    }

    fn version(&self) -> &'static str {
        "0.1.0"
    }

    fn dependencies(&self) -> Dependencies {
        Dependencies::default()
    }

    fn metadata(&self) -> Metadata {
        Metadata {
            description: "says hello",
            group: "demo",
            kind: "extension",
        }
    }

    async fn init(&self, ctx: &ExtensionCtx) -> anyhow::Result<()> {
        let template = ctx
            .config()
            .get("template")
            .and_then(Value::as_str)
            .unwrap_or("Hello, {name}!")
            .to_string();
        *self.template.write() = template;
        tracing::info!("greeter initialized");
        Ok(())
    }

    fn services(&self) -> HashMap<&'static str, ServiceMethod> {
        let template = self.template.read().clone();
        let mut table: HashMap<&'static str, ServiceMethod> = HashMap::new();
        table.insert(
            "Greet",
            Box::new(move |request: Value| {
                let name = request
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("world");
                Ok(json!({ "message": template.replace("{name}", name) }))
            }),
        );
        table
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
