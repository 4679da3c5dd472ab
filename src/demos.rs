//! Built-in demo journeys, pools and scenario sets.
//!
//! Journeys are registered code, not runtime-loaded modules, so the shipped
//! binary carries a few under the `demo:` prefix — enough to smoke-test a
//! deployment end to end.

use serde_json::{json, Map};
use tokio::time::Duration;

use crate::context::Context;
use crate::datapool::{recyclable_from_csv, DataPool, RecyclablePool};
use crate::errors::JourneyError;
use crate::pacing::Separation;
use crate::registry::{RegistryBuilder, ScenarioDef};
use crate::volume::{ConstantVolume, RampVolume, VolumeModel};

/// Sleeps briefly inside a transaction. No network, no data.
async fn nop_journey(
    ctx: Context,
    _args: Option<serde_json::Value>,
) -> Result<(), JourneyError> {
    ctx.transaction("nop", async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    })
    .await
}

/// GETs `target_url` from config once per invocation, paced to at least one
/// second per iteration.
async fn http_get_journey(
    ctx: Context,
    args: Option<serde_json::Value>,
) -> Result<(), JourneyError> {
    let url = ctx
        .config()
        .get_str("target_url")
        .ok_or_else(|| JourneyError::failure("config key 'target_url' not set"))?;
    let pacing = Separation::fixed(Duration::from_secs(1));

    ctx.transaction("get", async {
        let session = ctx.http()?.acquire().await?;
        let response = session.get(&ctx, &url).await?;
        response.expect_status(200)?;
        if let Some(args) = &args {
            let mut fields = Map::new();
            fields.insert("row".to_string(), args.clone());
            ctx.send("data_row_used", fields);
        }
        Ok(())
    })
    .await?;

    pacing.complete().await;
    Ok(())
}

/// Register everything under the `demo:` prefix.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .journey("demo:nop", nop_journey)
        .journey("demo:http_get", http_get_journey)
        .datapool("demo:numbers", || {
            Ok(Box::new(RecyclablePool::new(
                (1..=100).map(|i| json!({ "number": i })),
            )) as Box<dyn DataPool>)
        })
        .datapool("demo:users_csv", || {
            recyclable_from_csv("users.csv").map(|pool| Box::new(pool) as Box<dyn DataPool>)
        })
        .volume("demo:constant10", || {
            Box::new(ConstantVolume::new(10)) as Box<dyn VolumeModel>
        })
        .volume("demo:constant10for60s", || {
            Box::new(ConstantVolume::lasting(10, 60.0)) as Box<dyn VolumeModel>
        })
        .volume("demo:ramp50over5m", || {
            Box::new(RampVolume::new(0, 50, 300.0)) as Box<dyn VolumeModel>
        })
        .scenario_set(
            "demo",
            vec![ScenarioDef {
                journey: "demo:nop".to_string(),
                datapool: None,
                volume: "demo:constant10for60s".to_string(),
            }],
        )
        .scenario_set(
            "demo:http",
            vec![ScenarioDef {
                journey: "demo:http_get".to_string(),
                datapool: Some("demo:numbers".to_string()),
                volume: "demo:constant10for60s".to_string(),
            }],
        )
}
